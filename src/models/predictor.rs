//! Noise predictors: the per-step update rules of the sampler
//!
//! - [`AncestralPredictor`]: DDPM posterior step, used when every timestep is walked.
//! - [`PlmsPredictor`]: pseudo-linear multi-step update with a 4-stage
//!   Adams-Bashforth warm-up, used when timesteps are skipped.
//!
//! Both hold only the coefficient buffers they read, so each can be exported
//! and replayed on its own. Timesteps are `[1]`-shaped I64 tensors.

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::collections::VecDeque;

use crate::generation::SamplingContext;

/// Gather `a[t]` as a `[1, 1, 1, 1]` tensor for broadcasting over a sample.
pub fn extract(a: &Tensor, t: &Tensor) -> Result<Tensor> {
    let t = t.flatten_all()?;
    Ok(a.index_select(&t, 0)?.reshape((1, 1, 1, 1))?)
}

/// Host value of a `[1]`-shaped timestep tensor.
pub fn timestep_value(t: &Tensor) -> Result<i64> {
    let values = t.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    values
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("empty timestep tensor"))
}

/// DDPM ancestral step.
pub struct AncestralPredictor {
    sqrt_recip_alphas_cumprod: Tensor,
    sqrt_recipm1_alphas_cumprod: Tensor,
    posterior_log_variance_clipped: Tensor,
    posterior_mean_coef1: Tensor,
    posterior_mean_coef2: Tensor,
}

impl AncestralPredictor {
    pub const BUFFER_NAMES: [&'static str; 5] = [
        "sqrt_recip_alphas_cumprod",
        "sqrt_recipm1_alphas_cumprod",
        "posterior_log_variance_clipped",
        "posterior_mean_coef1",
        "posterior_mean_coef2",
    ];

    pub fn new(
        sqrt_recip_alphas_cumprod: Tensor,
        sqrt_recipm1_alphas_cumprod: Tensor,
        posterior_log_variance_clipped: Tensor,
        posterior_mean_coef1: Tensor,
        posterior_mean_coef2: Tensor,
    ) -> Result<Self> {
        let len = sqrt_recip_alphas_cumprod.dims1()?;
        for buffer in [
            &sqrt_recipm1_alphas_cumprod,
            &posterior_log_variance_clipped,
            &posterior_mean_coef1,
            &posterior_mean_coef2,
        ] {
            anyhow::ensure!(
                buffer.dims1()? == len,
                "ancestral buffers disagree in length: {} vs {}",
                buffer.dims1()?,
                len
            );
        }
        Ok(Self {
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.sqrt_recip_alphas_cumprod.dims()[0]
    }

    /// Posterior mean `q(x_{t-1} | x_t, x_0)` with `x_0` reconstructed from
    /// the noise estimate and clamped to `[-1, 1]`.
    pub fn posterior_mean(&self, x: &Tensor, noise_pred: &Tensor, t: &Tensor) -> Result<Tensor> {
        let x_recon = (x.broadcast_mul(&extract(&self.sqrt_recip_alphas_cumprod, t)?)?
            - noise_pred.broadcast_mul(&extract(&self.sqrt_recipm1_alphas_cumprod, t)?)?)?;
        let x_recon = x_recon.clamp(-1f32, 1f32)?;

        Ok((x_recon.broadcast_mul(&extract(&self.posterior_mean_coef1, t)?)?
            + x.broadcast_mul(&extract(&self.posterior_mean_coef2, t)?)?)?)
    }

    /// One ancestral step. Noise is only drawn for `t > 0`.
    pub fn step(
        &self,
        x: &Tensor,
        noise_pred: &Tensor,
        t: &Tensor,
        rng: &mut SamplingContext,
    ) -> Result<Tensor> {
        let mean = self.posterior_mean(x, noise_pred, t)?;
        if timestep_value(t)? <= 0 {
            return Ok(mean);
        }
        let std = (extract(&self.posterior_log_variance_clipped, t)? * 0.5)?.exp()?;
        let noise = rng.randn_like(x)?;
        Ok((mean + noise.broadcast_mul(&std)?)?)
    }

    pub fn named_buffers(&self) -> Vec<(String, Tensor)> {
        Self::BUFFER_NAMES
            .iter()
            .zip([
                &self.sqrt_recip_alphas_cumprod,
                &self.sqrt_recipm1_alphas_cumprod,
                &self.posterior_log_variance_clipped,
                &self.posterior_mean_coef1,
                &self.posterior_mean_coef2,
            ])
            .map(|(name, t)| (name.to_string(), t.clone()))
            .collect()
    }
}

/// Warm-up stage of the multi-step predictor, derived from how many prior
/// estimates are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlmsStage {
    /// No history: probe one extra network call (Heun-like)
    Stage0,
    Stage1,
    Stage2,
    /// Full 4th-order Adams-Bashforth
    Stage3,
}

impl PlmsStage {
    pub fn from_history_len(len: usize) -> Self {
        match len {
            0 => Self::Stage0,
            1 => Self::Stage1,
            2 => Self::Stage2,
            _ => Self::Stage3,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Stage0 => 0,
            Self::Stage1 => 1,
            Self::Stage2 => 2,
            Self::Stage3 => 3,
        }
    }
}

/// Bounded history of raw network estimates, oldest first.
#[derive(Debug, Clone)]
pub struct NoiseHistory {
    entries: VecDeque<Tensor>,
    capacity: usize,
}

impl Default for NoiseHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseHistory {
    pub const CAPACITY: usize = 3;

    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(Self::CAPACITY),
            capacity: Self::CAPACITY,
        }
    }

    /// Append an estimate, evicting the oldest when full.
    pub fn push(&mut self, noise: Tensor) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(noise);
    }

    /// `back(1)` is the most recent entry, `back(2)` the one before it.
    pub fn back(&self, n: usize) -> Result<&Tensor> {
        anyhow::ensure!(
            n >= 1 && n <= self.entries.len(),
            "history holds {} entries, asked for {} from the back",
            self.entries.len(),
            n
        );
        Ok(&self.entries[self.entries.len() - n])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stage(&self) -> PlmsStage {
        PlmsStage::from_history_len(self.entries.len())
    }
}

/// Pseudo-linear multi-step predictor.
pub struct PlmsPredictor {
    alphas_cumprod: Tensor,
}

impl PlmsPredictor {
    pub const BUFFER_NAMES: [&'static str; 1] = ["alphas_cumprod"];

    pub fn new(alphas_cumprod: Tensor) -> Result<Self> {
        alphas_cumprod.dims1()?;
        Ok(Self { alphas_cumprod })
    }

    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.dims()[0]
    }

    /// Move `x` from `t` to `t_prev` along the deterministic trajectory
    /// implied by `noise_t`.
    pub fn extrapolate(
        &self,
        x: &Tensor,
        noise_t: &Tensor,
        t: &Tensor,
        t_prev: &Tensor,
    ) -> Result<Tensor> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("plms_extrapolate").entered();

        let a_t = extract(&self.alphas_cumprod, t)?;
        let a_prev = extract(&self.alphas_cumprod, t_prev)?;
        let a_t_sq = a_t.sqrt()?;
        let a_prev_sq = a_prev.sqrt()?;

        let x_coef = (&a_t_sq * (&a_t_sq + &a_prev_sq)?)?.recip()?;
        let cross = ((a_prev.affine(-1.0, 1.0)? * &a_t)?.sqrt()?
            + (a_t.affine(-1.0, 1.0)? * &a_prev)?.sqrt()?)?;
        let noise_coef = (&a_t_sq * cross)?.recip()?;

        let direction = (x.broadcast_mul(&x_coef)? - noise_t.broadcast_mul(&noise_coef)?)?;
        let x_delta = direction.broadcast_mul(&(a_prev - a_t)?)?;
        Ok((x + x_delta)?)
    }

    /// Average of the estimate at `t` and the probe estimate at `t_prev`.
    pub fn predict_stage0(&self, noise_pred: &Tensor, noise_pred_prev: &Tensor) -> Result<Tensor> {
        Ok(((noise_pred + noise_pred_prev)? / 2.0)?)
    }

    pub fn predict_stage1(&self, noise_pred: &Tensor, history: &NoiseHistory) -> Result<Tensor> {
        Ok((((noise_pred * 3.0)? - history.back(1)?)? / 2.0)?)
    }

    pub fn predict_stage2(&self, noise_pred: &Tensor, history: &NoiseHistory) -> Result<Tensor> {
        let y = ((noise_pred * 23.0)? - (history.back(1)? * 16.0)?)?;
        let y = (y + (history.back(2)? * 5.0)?)?;
        Ok((y / 12.0)?)
    }

    pub fn predict_stage3(&self, noise_pred: &Tensor, history: &NoiseHistory) -> Result<Tensor> {
        let y = ((noise_pred * 55.0)? - (history.back(1)? * 59.0)?)?;
        let y = (y + (history.back(2)? * 37.0)?)?;
        let y = (y - (history.back(3)? * 9.0)?)?;
        Ok((y / 24.0)?)
    }

    /// Combine the current estimate with the history according to the
    /// warm-up stage. `probe(x_pred, t_prev)` runs the network once more and
    /// is only called in [`PlmsStage::Stage0`].
    pub fn combine<F>(
        &self,
        x: &Tensor,
        noise_pred: &Tensor,
        t: &Tensor,
        t_prev: &Tensor,
        history: &NoiseHistory,
        probe: F,
    ) -> Result<Tensor>
    where
        F: FnOnce(&Tensor, &Tensor) -> Result<Tensor>,
    {
        match history.stage() {
            PlmsStage::Stage0 => {
                let x_pred = self.extrapolate(x, noise_pred, t, t_prev)?;
                let noise_pred_prev = probe(&x_pred, t_prev)?;
                self.predict_stage0(noise_pred, &noise_pred_prev)
            }
            PlmsStage::Stage1 => self.predict_stage1(noise_pred, history),
            PlmsStage::Stage2 => self.predict_stage2(noise_pred, history),
            PlmsStage::Stage3 => self.predict_stage3(noise_pred, history),
        }
    }

    pub fn named_buffers(&self) -> Vec<(String, Tensor)> {
        vec![(Self::BUFFER_NAMES[0].to_string(), self.alphas_cumprod.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schedule::{to_buffer, DiffusionSchedule, ScheduleKind};
    use candle_core::Device;

    fn timestep(t: i64) -> Tensor {
        Tensor::new(&[t], &Device::Cpu).unwrap()
    }

    fn ancestral(schedule: &DiffusionSchedule) -> AncestralPredictor {
        let device = Device::Cpu;
        AncestralPredictor::new(
            to_buffer(&schedule.sqrt_recip_alphas_cumprod, &device).unwrap(),
            to_buffer(&schedule.sqrt_recipm1_alphas_cumprod, &device).unwrap(),
            to_buffer(&schedule.posterior_log_variance_clipped, &device).unwrap(),
            to_buffer(&schedule.posterior_mean_coef1, &device).unwrap(),
            to_buffer(&schedule.posterior_mean_coef2, &device).unwrap(),
        )
        .unwrap()
    }

    fn plms(schedule: &DiffusionSchedule) -> PlmsPredictor {
        PlmsPredictor::new(to_buffer(&schedule.alphas_cumprod, &Device::Cpu).unwrap()).unwrap()
    }

    fn filled(value: f32) -> Tensor {
        Tensor::full(value, (1, 1, 2, 3), &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_extract_shape() {
        let a = Tensor::new(&[0.1f32, 0.2, 0.3], &Device::Cpu).unwrap();
        let v = extract(&a, &timestep(2)).unwrap();
        assert_eq!(v.dims(), &[1, 1, 1, 1]);
        assert_eq!(values(&v), vec![0.3]);
    }

    #[test]
    fn test_ancestral_terminal_step_is_deterministic() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Cosine, 100, 0.01).unwrap();
        let predictor = ancestral(&schedule);
        let x = Tensor::randn(0f32, 1.0, (1, 1, 4, 5), &Device::Cpu).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 1, 4, 5), &Device::Cpu).unwrap();

        let mut rng_a = SamplingContext::new(Some(1));
        let mut rng_b = SamplingContext::new(Some(2));
        let a = predictor.step(&x, &noise, &timestep(0), &mut rng_a).unwrap();
        let b = predictor.step(&x, &noise, &timestep(0), &mut rng_b).unwrap();
        let mean = predictor.posterior_mean(&x, &noise, &timestep(0)).unwrap();
        assert_eq!(values(&a), values(&b));
        assert_eq!(values(&a), values(&mean));

        // No draw happened at t = 0.
        let mut fresh = SamplingContext::new(Some(1));
        assert_eq!(rng_a.randn_f32(), fresh.randn_f32());
    }

    #[test]
    fn test_ancestral_step_adds_noise_above_zero() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Cosine, 100, 0.01).unwrap();
        let predictor = ancestral(&schedule);
        let x = filled(0.3);
        let noise = filled(0.1);

        let mut rng = SamplingContext::new(Some(5));
        let stepped = predictor.step(&x, &noise, &timestep(50), &mut rng).unwrap();
        let mean = predictor.posterior_mean(&x, &noise, &timestep(50)).unwrap();
        assert_ne!(values(&stepped), values(&mean));
    }

    #[test]
    fn test_ancestral_reconstruction_is_clamped() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Linear, 10, 0.01).unwrap();
        let predictor = ancestral(&schedule);
        // At t = 0, coef1 ~ 1 and coef2 = 0, so the mean is the clamped reconstruction.
        let mean = predictor
            .posterior_mean(&filled(50.0), &filled(0.0), &timestep(0))
            .unwrap();
        assert!(values(&mean).iter().all(|&v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_ancestral_rejects_mismatched_buffers() {
        let device = Device::Cpu;
        let a = Tensor::zeros(4, DType::F32, &device).unwrap();
        let b = Tensor::zeros(5, DType::F32, &device).unwrap();
        assert!(AncestralPredictor::new(a.clone(), a.clone(), a.clone(), a, b).is_err());
    }

    #[test]
    fn test_extrapolate_same_timestep_is_identity() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Cosine, 100, 0.01).unwrap();
        let predictor = plms(&schedule);
        let x = Tensor::randn(0f32, 1.0, (1, 1, 4, 5), &Device::Cpu).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 1, 4, 5), &Device::Cpu).unwrap();
        let out = predictor
            .extrapolate(&x, &noise, &timestep(40), &timestep(40))
            .unwrap();
        assert_eq!(values(&out), values(&x));
    }

    #[test]
    fn test_extrapolate_matches_closed_form() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Linear, 100, 0.02).unwrap();
        let predictor = plms(&schedule);
        let (t, t_prev) = (60usize, 50usize);
        let out = predictor
            .extrapolate(&filled(0.5), &filled(0.2), &timestep(60), &timestep(50))
            .unwrap();

        let a_t = schedule.alphas_cumprod[t];
        let a_prev = schedule.alphas_cumprod[t_prev];
        let expected = 0.5
            + (a_prev - a_t)
                * (0.5 / (a_t.sqrt() * (a_t.sqrt() + a_prev.sqrt()))
                    - 0.2
                        / (a_t.sqrt()
                            * (((1.0 - a_prev) * a_t).sqrt() + ((1.0 - a_t) * a_prev).sqrt())));
        for v in values(&out) {
            assert!((v as f64 - expected).abs() < 1e-5, "{} vs {}", v, expected);
        }
    }

    #[test]
    fn test_stage_formulas() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Linear, 10, 0.01).unwrap();
        let predictor = plms(&schedule);
        let mut history = NoiseHistory::new();
        history.push(filled(4.0));
        history.push(filled(2.0));
        history.push(filled(1.0));

        let n = filled(1.0);
        // h[-1] = 1, h[-2] = 2, h[-3] = 4
        let s0 = predictor.predict_stage0(&n, &filled(3.0)).unwrap();
        let s1 = predictor.predict_stage1(&n, &history).unwrap();
        let s2 = predictor.predict_stage2(&n, &history).unwrap();
        let s3 = predictor.predict_stage3(&n, &history).unwrap();
        assert_eq!(values(&s0)[0], 2.0);
        assert_eq!(values(&s1)[0], 1.0);
        assert!((values(&s2)[0] - 17.0 / 12.0).abs() < 1e-6);
        assert!((values(&s3)[0] - 34.0 / 24.0).abs() < 1e-6);
    }

    #[test]
    fn test_plms_stage_from_history_len() {
        assert_eq!(PlmsStage::from_history_len(0), PlmsStage::Stage0);
        assert_eq!(PlmsStage::from_history_len(1), PlmsStage::Stage1);
        assert_eq!(PlmsStage::from_history_len(2), PlmsStage::Stage2);
        assert_eq!(PlmsStage::from_history_len(3), PlmsStage::Stage3);
        assert_eq!(PlmsStage::from_history_len(7), PlmsStage::Stage3);
        assert_eq!(PlmsStage::Stage2.index(), 2);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = NoiseHistory::new();
        for v in 1..=5 {
            history.push(filled(v as f32));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(values(history.back(1).unwrap())[0], 5.0);
        assert_eq!(values(history.back(3).unwrap())[0], 3.0);
        assert!(history.back(4).is_err());
        assert!(history.back(0).is_err());

        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_plms_warm_up_sequence() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Cosine, 100, 0.01).unwrap();
        let predictor = plms(&schedule);
        let x = filled(0.1);
        let mut history = NoiseHistory::new();
        let mut probes = 0;
        let mut stages = Vec::new();

        for (call, t) in [90i64, 80, 70, 60].into_iter().enumerate() {
            let noise = filled(call as f32 + 1.0);
            stages.push(history.stage());
            predictor
                .combine(&x, &noise, &timestep(t), &timestep(t - 10), &history, |x_pred, _| {
                    probes += 1;
                    Ok(x_pred.zeros_like()?)
                })
                .unwrap();
            history.push(noise);
        }

        assert_eq!(
            stages,
            vec![
                PlmsStage::Stage0,
                PlmsStage::Stage1,
                PlmsStage::Stage2,
                PlmsStage::Stage3
            ]
        );
        assert_eq!(probes, 1);
        assert_eq!(history.len(), 3);
        let recent: Vec<f32> = (1..=3)
            .rev()
            .map(|n| values(history.back(n).unwrap())[0])
            .collect();
        assert_eq!(recent, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_named_buffers() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Linear, 10, 0.01).unwrap();
        let names: Vec<String> = ancestral(&schedule)
            .named_buffers()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, AncestralPredictor::BUFFER_NAMES.to_vec());
        assert_eq!(plms(&schedule).named_buffers().len(), 1);
        assert_eq!(plms(&schedule).num_timesteps(), 10);
    }
}
