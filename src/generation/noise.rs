//! Reproducible Gaussian noise for the diffusion sampler
//!
//! All randomness for one sampling call lives in a [`SamplingContext`]. Draws
//! happen on the host and are uploaded, so a seed gives the same noise on CPU,
//! CUDA and Metal.

use anyhow::Result;
use candle_core::{Device, Shape, Tensor};

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const PCG_INCREMENT: u64 = 1442695040888963407;
const SEED_MIX: u64 = 2685821657736338717;

/// RNG state for a single sampling call.
///
/// Encapsulates all randomness so that multiple calls can run
/// concurrently without interfering with each other.
///
/// # Determinism
///
/// When created with a seed, the same seed produces identical noise
/// across runs, threads and devices. Without a seed, one seed is drawn
/// from OS entropy; [`seed`](Self::seed) reports it so the run can be
/// repeated.
#[derive(Debug, Clone)]
pub struct SamplingContext {
    /// PCG state
    state: u64,
    seed: u64,
    /// Whether the seed was supplied by the caller
    seeded: bool,
    /// Second Box-Muller output, consumed by the next normal draw
    spare: Option<f32>,
}

fn mix_seed(seed: u64) -> u64 {
    seed.wrapping_mul(SEED_MIX).wrapping_add(PCG_INCREMENT)
}

impl SamplingContext {
    /// Create a new context with an optional seed.
    pub fn new(seed: Option<u64>) -> Self {
        let (seed, seeded) = match seed {
            Some(s) => (s, true),
            None => (rand::random::<u64>(), false),
        };
        Self {
            state: mix_seed(seed),
            seed,
            seeded,
            spare: None,
        }
    }

    /// Rewind to the initial state for `seed`.
    pub fn reset(&mut self, seed: u64) {
        self.state = mix_seed(seed);
        self.seed = seed;
        self.seeded = true;
        self.spare = None;
    }

    /// Seed in use, caller-supplied or drawn at construction.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// PCG XSH RR 64/32
    fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(PCG_INCREMENT);

        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform f32 in `[0, 1)`.
    pub fn rand_f32(&mut self) -> f32 {
        // 24 mantissa bits keep the result strictly below 1.0
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Standard normal sample (Box-Muller).
    pub fn randn_f32(&mut self) -> f32 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        // u1 in (0, 1] so the log is finite
        let u1 = 1.0 - (self.next_u32() as f64) / (u32::MAX as f64 + 1.0);
        let u2 = (self.next_u32() as f64) / (u32::MAX as f64 + 1.0);
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare = Some((radius * theta.sin()) as f32);
        (radius * theta.cos()) as f32
    }

    /// Standard normal tensor of the given shape.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| self.randn_f32()).collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    /// Standard normal tensor shaped like `x`, on the same device.
    pub fn randn_like(&mut self, x: &Tensor) -> Result<Tensor> {
        self.randn(x.shape().clone(), x.device())
    }

    /// Uniform tensor in `[low, high)`.
    pub fn rand_uniform<S: Into<Shape>>(
        &mut self,
        shape: S,
        low: f32,
        high: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| low + (high - low) * self.rand_f32())
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}
