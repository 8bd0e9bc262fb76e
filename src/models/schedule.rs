//! Variance schedules and the per-timestep coefficients derived from them
//!
//! Everything is computed once in f64 on the host and handed to the device as
//! 1-D f32 buffers indexed by timestep.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::f64::consts::PI;
use std::str::FromStr;

/// Offset used by the cosine schedule to keep beta small near t = 0.
const COSINE_S: f64 = 0.008;
/// Lower end of the linear schedule.
const LINEAR_BETA_START: f64 = 1e-4;
/// Upper clip of cosine betas.
const MAX_COSINE_BETA: f64 = 0.999;
/// Floor applied before taking the log of the posterior variance.
const POSTERIOR_VARIANCE_FLOOR: f64 = 1e-20;

/// Shape of the beta schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Linear,
    Cosine,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Cosine => "cosine",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            other => anyhow::bail!(
                "Unknown schedule_type '{}'. Expected 'linear' or 'cosine'",
                other
            ),
        }
    }
}

/// `n` evenly spaced points over `[start, end]`, endpoints included.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Linearly increasing betas from `1e-4` to `max_beta`.
pub fn linear_betas(timesteps: usize, max_beta: f64) -> Vec<f64> {
    linspace(LINEAR_BETA_START, max_beta, timesteps)
}

/// Cosine schedule (Nichol & Dhariwal), clipped to `[0, 0.999]`.
pub fn cosine_betas(timesteps: usize) -> Vec<f64> {
    let steps = timesteps + 1;
    let alphas_cumprod: Vec<f64> = linspace(0.0, steps as f64, steps)
        .into_iter()
        .map(|x| {
            let angle = ((x / steps as f64) + COSINE_S) / (1.0 + COSINE_S) * PI * 0.5;
            angle.cos().powi(2)
        })
        .collect();
    let first = alphas_cumprod[0];
    let alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a / first).collect();

    alphas_cumprod
        .windows(2)
        .map(|w| (1.0 - w[1] / w[0]).clamp(0.0, MAX_COSINE_BETA))
        .collect()
}

/// Betas for `kind`; `max_beta` only affects the linear schedule.
pub fn beta_schedule(kind: ScheduleKind, timesteps: usize, max_beta: f64) -> Vec<f64> {
    match kind {
        ScheduleKind::Linear => linear_betas(timesteps, max_beta),
        ScheduleKind::Cosine => cosine_betas(timesteps),
    }
}

/// Host-side schedule plus every coefficient array the predictors read.
#[derive(Debug, Clone)]
pub struct DiffusionSchedule {
    pub kind: ScheduleKind,
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub posterior_variance: Vec<f64>,
    pub posterior_log_variance_clipped: Vec<f64>,
    pub posterior_mean_coef1: Vec<f64>,
    pub posterior_mean_coef2: Vec<f64>,
}

impl DiffusionSchedule {
    pub fn new(kind: ScheduleKind, timesteps: usize, max_beta: f64) -> Result<Self> {
        anyhow::ensure!(timesteps > 0, "timesteps must be positive");
        if kind == ScheduleKind::Linear {
            anyhow::ensure!(
                max_beta > 0.0 && max_beta < 1.0,
                "max_beta must be in (0, 1), got {}",
                max_beta
            );
        }
        Ok(Self::from_betas(kind, beta_schedule(kind, timesteps, max_beta)))
    }

    /// Derive all coefficient arrays from an explicit beta sequence.
    pub fn from_betas(kind: ScheduleKind, betas: Vec<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod: Vec<f64> = alphas
            .iter()
            .scan(1.0, |acc, a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .take(alphas_cumprod.len())
            .collect();

        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod
            .iter()
            .map(|a| (1.0 / a - 1.0).sqrt())
            .collect();

        let n = betas.len();
        let mut posterior_variance = Vec::with_capacity(n);
        let mut posterior_mean_coef1 = Vec::with_capacity(n);
        let mut posterior_mean_coef2 = Vec::with_capacity(n);
        for i in 0..n {
            let (beta, ac, ac_prev) = (betas[i], alphas_cumprod[i], alphas_cumprod_prev[i]);
            posterior_variance.push(beta * (1.0 - ac_prev) / (1.0 - ac));
            posterior_mean_coef1.push(beta * ac_prev.sqrt() / (1.0 - ac));
            posterior_mean_coef2.push((1.0 - ac_prev) * alphas[i].sqrt() / (1.0 - ac));
        }
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .map(|v: &f64| v.max(POSTERIOR_VARIANCE_FLOOR).ln())
            .collect();

        Self {
            kind,
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        }
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }
}

/// Upload a host coefficient array as a 1-D f32 buffer.
pub fn to_buffer(values: &[f64], device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Ok(Tensor::from_vec(data, values.len(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_kind_parse() {
        assert_eq!("linear".parse::<ScheduleKind>().unwrap(), ScheduleKind::Linear);
        assert_eq!("cosine".parse::<ScheduleKind>().unwrap(), ScheduleKind::Cosine);
        assert!("quadratic".parse::<ScheduleKind>().is_err());
        assert!("Cosine".parse::<ScheduleKind>().is_err());
    }

    #[test]
    fn test_linear_betas_endpoints() {
        let betas = linear_betas(1000, 0.02);
        assert_eq!(betas.len(), 1000);
        assert!((betas[0] - 1e-4).abs() < 1e-15);
        assert!((betas[999] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_betas_clipped() {
        let betas = cosine_betas(1000);
        assert_eq!(betas.len(), 1000);
        assert!(betas.iter().all(|&b| (0.0..=0.999).contains(&b)));
        // The last step is where the cosine schedule saturates.
        assert!((betas[999] - 0.999).abs() < 1e-12);
    }

    #[test]
    fn test_alphas_cumprod_monotonic() {
        for kind in [ScheduleKind::Linear, ScheduleKind::Cosine] {
            let schedule = DiffusionSchedule::new(kind, 1000, 0.01).unwrap();
            assert_eq!(schedule.len(), 1000);
            let first = schedule.alphas_cumprod[0];
            assert!((first - (1.0 - schedule.betas[0])).abs() < 1e-12);
            assert!(first <= 1.0, "{:?} alphas_cumprod[0] = {}", kind, first);
            for w in schedule.alphas_cumprod.windows(2) {
                assert!(w[1] < w[0], "{:?} alphas_cumprod not decreasing", kind);
                assert!(w[1] > 0.0);
            }
            for w in schedule.sqrt_recip_alphas_cumprod.windows(2) {
                assert!(w[1] > w[0]);
            }
            let uploaded: Vec<f32> = to_buffer(&schedule.alphas_cumprod, &Device::Cpu)
                .unwrap()
                .to_vec1()
                .unwrap();
            for w in uploaded.windows(2) {
                assert!(w[1] < w[0], "{:?} f32 alphas_cumprod not decreasing", kind);
            }
        }
    }

    #[test]
    fn test_alphas_cumprod_prev_shifted() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Linear, 50, 0.01).unwrap();
        assert_eq!(schedule.alphas_cumprod_prev[0], 1.0);
        for i in 1..50 {
            assert_eq!(schedule.alphas_cumprod_prev[i], schedule.alphas_cumprod[i - 1]);
        }
    }

    #[test]
    fn test_posterior_variance_floor_at_zero() {
        // ac_prev[0] = 1 makes the first posterior variance exactly zero.
        let schedule = DiffusionSchedule::new(ScheduleKind::Cosine, 100, 0.01).unwrap();
        assert_eq!(schedule.posterior_variance[0], 0.0);
        assert!((schedule.posterior_log_variance_clipped[0] - 1e-20f64.ln()).abs() < 1e-9);
        assert!(schedule.posterior_log_variance_clipped[1] > 1e-20f64.ln());
    }

    #[test]
    fn test_posterior_mean_coefs_at_zero() {
        let schedule = DiffusionSchedule::new(ScheduleKind::Linear, 10, 0.01).unwrap();
        // At t = 0 the posterior mean is the reconstruction itself.
        assert!((schedule.posterior_mean_coef1[0] - 1.0).abs() < 1e-9);
        assert_eq!(schedule.posterior_mean_coef2[0], 0.0);
    }

    #[test]
    fn test_schedule_rejects_bad_arguments() {
        assert!(DiffusionSchedule::new(ScheduleKind::Cosine, 0, 0.01).is_err());
        assert!(DiffusionSchedule::new(ScheduleKind::Linear, 10, 1.5).is_err());
    }

    #[test]
    fn test_to_buffer() {
        let buffer = to_buffer(&[0.5, 0.25], &Device::Cpu).unwrap();
        assert_eq!(buffer.dims(), &[2]);
        assert_eq!(buffer.to_vec1::<f32>().unwrap(), vec![0.5, 0.25]);
    }
}
