//! Gaussian diffusion container and buffer migration
//!
//! [`GaussianDiffusion`] is the shape a checkpoint is restored into: the
//! denoiser plus every per-timestep coefficient buffer and the mel range, all
//! held at the top level. [`GaussianDiffusion::build_submodules`] consumes it and
//! hands each buffer to the one leaf module that reads it, producing a
//! [`DiffusionSampler`]. Sampling and export are only available on the result.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;

use super::config::AcousticConfig;
use super::denoiser::{DiffNet, DiffNetConfig};
use super::predictor::{AncestralPredictor, PlmsPredictor};
use super::rescaler::MelRescaler;
use super::schedule::{to_buffer, DiffusionSchedule};
use crate::generation::DiffusionSampler;

/// Checkpoint prefix of the denoiser weights.
pub const DENOISER_PREFIX: &str = "denoise_fn.";

/// Which buffers came from the checkpoint and which were kept as computed.
#[derive(Debug, Clone, Default)]
pub struct BufferLoadReport {
    pub loaded: Vec<String>,
    pub computed: Vec<String>,
}

/// Top-level buffers, in checkpoint naming.
struct DiffusionBuffers {
    alphas_cumprod: Tensor,
    sqrt_recip_alphas_cumprod: Tensor,
    sqrt_recipm1_alphas_cumprod: Tensor,
    posterior_log_variance_clipped: Tensor,
    posterior_mean_coef1: Tensor,
    posterior_mean_coef2: Tensor,
    spec_min: Tensor,
    spec_max: Tensor,
}

impl DiffusionBuffers {
    fn new(schedule: &DiffusionSchedule, config: &AcousticConfig, device: &Device) -> Result<Self> {
        let bins = config.keep_bins();
        let spec_min = Tensor::from_vec(config.spec_min[..bins].to_vec(), (1, 1, bins), device)?;
        let spec_max = Tensor::from_vec(config.spec_max[..bins].to_vec(), (1, 1, bins), device)?;
        Ok(Self {
            alphas_cumprod: to_buffer(&schedule.alphas_cumprod, device)?,
            sqrt_recip_alphas_cumprod: to_buffer(&schedule.sqrt_recip_alphas_cumprod, device)?,
            sqrt_recipm1_alphas_cumprod: to_buffer(&schedule.sqrt_recipm1_alphas_cumprod, device)?,
            posterior_log_variance_clipped: to_buffer(
                &schedule.posterior_log_variance_clipped,
                device,
            )?,
            posterior_mean_coef1: to_buffer(&schedule.posterior_mean_coef1, device)?,
            posterior_mean_coef2: to_buffer(&schedule.posterior_mean_coef2, device)?,
            spec_min,
            spec_max,
        })
    }

    fn named(&self) -> [(&'static str, &Tensor); 8] {
        [
            ("alphas_cumprod", &self.alphas_cumprod),
            ("sqrt_recip_alphas_cumprod", &self.sqrt_recip_alphas_cumprod),
            ("sqrt_recipm1_alphas_cumprod", &self.sqrt_recipm1_alphas_cumprod),
            ("posterior_log_variance_clipped", &self.posterior_log_variance_clipped),
            ("posterior_mean_coef1", &self.posterior_mean_coef1),
            ("posterior_mean_coef2", &self.posterior_mean_coef2),
            ("spec_min", &self.spec_min),
            ("spec_max", &self.spec_max),
        ]
    }

    fn slot(&mut self, name: &str) -> Option<&mut Tensor> {
        match name {
            "alphas_cumprod" => Some(&mut self.alphas_cumprod),
            "sqrt_recip_alphas_cumprod" => Some(&mut self.sqrt_recip_alphas_cumprod),
            "sqrt_recipm1_alphas_cumprod" => Some(&mut self.sqrt_recipm1_alphas_cumprod),
            "posterior_log_variance_clipped" => Some(&mut self.posterior_log_variance_clipped),
            "posterior_mean_coef1" => Some(&mut self.posterior_mean_coef1),
            "posterior_mean_coef2" => Some(&mut self.posterior_mean_coef2),
            "spec_min" => Some(&mut self.spec_min),
            "spec_max" => Some(&mut self.spec_max),
            _ => None,
        }
    }
}

/// Denoiser plus top-level diffusion buffers, before migration.
pub struct GaussianDiffusion {
    denoise_fn: DiffNet,
    schedule: DiffusionSchedule,
    buffers: DiffusionBuffers,
    k_step: usize,
    device: Device,
}

impl GaussianDiffusion {
    pub const BUFFER_NAMES: [&'static str; 8] = [
        "alphas_cumprod",
        "sqrt_recip_alphas_cumprod",
        "sqrt_recipm1_alphas_cumprod",
        "posterior_log_variance_clipped",
        "posterior_mean_coef1",
        "posterior_mean_coef2",
        "spec_min",
        "spec_max",
    ];

    /// Build the container. `vb` must point at the denoiser weights.
    pub fn new(config: &AcousticConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let schedule =
            DiffusionSchedule::new(config.schedule_kind()?, config.timesteps, config.max_beta)?;
        let buffers = DiffusionBuffers::new(&schedule, config, &device)?;
        let denoise_fn = DiffNet::new(DiffNetConfig::from_acoustic(config), vb)?;

        tracing::debug!(
            "GaussianDiffusion: {} schedule, {} timesteps, K_step {}",
            schedule.kind.as_str(),
            schedule.len(),
            config.k_step()
        );

        Ok(Self {
            denoise_fn,
            schedule,
            buffers,
            k_step: config.k_step(),
            device,
        })
    }

    /// Restore from a full checkpoint: `denoise_fn.*` strictly, diffusion
    /// buffers best-effort. Other keys (e.g. `fs2.*`) are ignored.
    pub fn from_weights(
        config: &AcousticConfig,
        weights: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<(Self, BufferLoadReport)> {
        let denoiser_weights = crate::filter_weights(weights, DENOISER_PREFIX);
        anyhow::ensure!(
            !denoiser_weights.is_empty(),
            "checkpoint has no '{}*' weights",
            DENOISER_PREFIX
        );
        let vb = VarBuilder::from_tensors(denoiser_weights, DType::F32, device);
        let mut diffusion = Self::new(config, vb)?;
        let report = diffusion.load_buffers(weights)?;
        Ok((diffusion, report))
    }

    /// Non-strict buffer load: present buffers override the computed ones,
    /// absent ones are kept. A shape mismatch is an error.
    pub fn load_buffers(&mut self, weights: &HashMap<String, Tensor>) -> Result<BufferLoadReport> {
        let mut report = BufferLoadReport::default();
        for name in Self::BUFFER_NAMES {
            let slot = self
                .buffers
                .slot(name)
                .ok_or_else(|| anyhow::anyhow!("unknown buffer '{}'", name))?;
            match weights.get(name) {
                Some(tensor) => {
                    anyhow::ensure!(
                        tensor.dims() == slot.dims(),
                        "shape mismatch for buffer '{}': checkpoint {:?}, model {:?}",
                        name,
                        tensor.dims(),
                        slot.dims()
                    );
                    *slot = tensor.to_dtype(DType::F32)?.to_device(&self.device)?;
                    report.loaded.push(name.to_string());
                }
                None => report.computed.push(name.to_string()),
            }
        }
        tracing::info!(
            "Loaded {} diffusion buffers from checkpoint, {} computed",
            report.loaded.len(),
            report.computed.len()
        );
        Ok(report)
    }

    pub fn schedule(&self) -> &DiffusionSchedule {
        &self.schedule
    }

    pub fn k_step(&self) -> usize {
        self.k_step
    }

    pub fn denoiser(&self) -> &DiffNet {
        &self.denoise_fn
    }

    /// Current value of a top-level buffer.
    pub fn buffer(&self, name: &str) -> Option<&Tensor> {
        self.buffers
            .named()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
    }

    pub fn named_buffers(&self) -> Vec<(String, Tensor)> {
        self.buffers
            .named()
            .into_iter()
            .map(|(n, t)| (n.to_string(), t.clone()))
            .collect()
    }

    /// Hand every buffer to the leaf module that reads it.
    pub fn build_submodules(self) -> Result<DiffusionSampler> {
        let Self {
            denoise_fn,
            buffers,
            k_step,
            device,
            ..
        } = self;

        let ancestral = AncestralPredictor::new(
            buffers.sqrt_recip_alphas_cumprod,
            buffers.sqrt_recipm1_alphas_cumprod,
            buffers.posterior_log_variance_clipped,
            buffers.posterior_mean_coef1,
            buffers.posterior_mean_coef2,
        )?;
        let plms = PlmsPredictor::new(buffers.alphas_cumprod)?;
        let rescaler = MelRescaler::new(buffers.spec_min, buffers.spec_max)?;

        tracing::info!(
            "Migrated diffusion buffers: {} -> ancestral, {} -> plms, {} -> rescaler",
            AncestralPredictor::BUFFER_NAMES.len(),
            PlmsPredictor::BUFFER_NAMES.len(),
            MelRescaler::BUFFER_NAMES.len()
        );

        DiffusionSampler::new(denoise_fn, ancestral, plms, rescaler, k_step, device)
    }
}
