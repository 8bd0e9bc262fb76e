//! Mel range rescaler
//!
//! The decoder works in a `[-1, 1]` normalized space; this maps samples back to
//! the mel range recorded at training time (`spec_min` / `spec_max`).

use anyhow::Result;
use candle_core::Tensor;

pub struct MelRescaler {
    /// Shape [1, 1, mel_bins]
    spec_min: Tensor,
    /// Shape [1, 1, mel_bins]
    spec_max: Tensor,
}

impl MelRescaler {
    pub const BUFFER_NAMES: [&'static str; 2] = ["spec_min", "spec_max"];

    /// Accepts `[mel_bins]` or `[1, 1, mel_bins]` buffers.
    pub fn new(spec_min: Tensor, spec_max: Tensor) -> Result<Self> {
        let bins = spec_min.elem_count();
        anyhow::ensure!(
            spec_max.elem_count() == bins,
            "spec_min has {} bins but spec_max has {}",
            bins,
            spec_max.elem_count()
        );
        Ok(Self {
            spec_min: spec_min.reshape((1, 1, bins))?,
            spec_max: spec_max.reshape((1, 1, bins))?,
        })
    }

    pub fn mel_bins(&self) -> usize {
        self.spec_min.dims()[2]
    }

    fn half_range(&self) -> Result<(Tensor, Tensor)> {
        let d = ((&self.spec_max - &self.spec_min)? / 2.0)?;
        let m = ((&self.spec_max + &self.spec_min)? / 2.0)?;
        Ok((d, m))
    }

    /// `x`: [batch, 1, mel_bins, frames] -> mel [batch, frames, mel_bins]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.squeeze(1)?.permute((0, 2, 1))?;
        let (d, m) = self.half_range()?;
        Ok(x.broadcast_mul(&d)?.broadcast_add(&m)?)
    }

    /// mel [batch, frames, mel_bins] -> normalized [batch, 1, mel_bins, frames]
    pub fn inverse(&self, mel: &Tensor) -> Result<Tensor> {
        let (d, m) = self.half_range()?;
        let x = mel.broadcast_sub(&m)?.broadcast_div(&d)?;
        Ok(x.permute((0, 2, 1))?.unsqueeze(1)?.contiguous()?)
    }

    pub fn named_buffers(&self) -> Vec<(String, Tensor)> {
        vec![
            ("spec_min".to_string(), self.spec_min.clone()),
            ("spec_max".to_string(), self.spec_max.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rescaler() -> MelRescaler {
        let device = Device::Cpu;
        MelRescaler::new(
            Tensor::new(&[-6.0f32, -4.0, -2.0], &device).unwrap(),
            Tensor::new(&[0.0f32, 2.0, 1.0], &device).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_forward_layout_and_range() {
        let device = Device::Cpu;
        let r = rescaler();
        assert_eq!(r.mel_bins(), 3);

        // -1 maps to spec_min, +1 to spec_max
        let lo = Tensor::full(-1f32, (1, 1, 3, 4), &device).unwrap();
        let hi = Tensor::full(1f32, (1, 1, 3, 4), &device).unwrap();
        let mel_lo = r.forward(&lo).unwrap();
        let mel_hi = r.forward(&hi).unwrap();
        assert_eq!(mel_lo.dims(), &[1, 4, 3]);

        let lo: Vec<Vec<Vec<f32>>> = mel_lo.to_vec3().unwrap();
        let hi: Vec<Vec<Vec<f32>>> = mel_hi.to_vec3().unwrap();
        for frame in 0..4 {
            assert_eq!(lo[0][frame], vec![-6.0, -4.0, -2.0]);
            assert_eq!(hi[0][frame], vec![0.0, 2.0, 1.0]);
        }
    }

    #[test]
    fn test_inverse_round_trip() {
        let device = Device::Cpu;
        let r = rescaler();
        let x = Tensor::randn(0f32, 0.5, (1, 1, 3, 7), &device).unwrap();
        let back = r.inverse(&r.forward(&x).unwrap()).unwrap();
        assert_eq!(back.dims(), x.dims());

        let a: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = back.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in a.iter().zip(b.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_mismatched_range() {
        let device = Device::Cpu;
        let result = MelRescaler::new(
            Tensor::zeros(3, candle_core::DType::F32, &device).unwrap(),
            Tensor::zeros(4, candle_core::DType::F32, &device).unwrap(),
        );
        assert!(result.is_err());
    }
}
