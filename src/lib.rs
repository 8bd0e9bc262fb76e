//! # DiffSinger acoustic decoder
//!
//! Pure Rust inference and sub-graph export for the diffusion mel decoder of
//! [DiffSinger](https://github.com/openvpi/DiffSinger) acoustic models.
//!
//! ## Features
//!
//! - **Ancestral (DDPM)** sampling over every step and **PLMS** sampling with a
//!   step multiplier (`speedup`) chosen per call
//! - **Deterministic** runs from a seed, independent of the device
//! - **Sub-graph export** of the denoiser, the PLMS noise predictor and the mel
//!   rescaler, with bit-exact replay for parity checks
//! - **CUDA** / **Metal** / MKL / Accelerate backends via candle features
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use diffsinger_acoustic::{AcousticModel, SampleOptions, auto_device};
//!
//! let device = auto_device()?;
//! let model = AcousticModel::from_pretrained("path/to/model", device)?;
//!
//! // condition: [1, hidden_size, frames] from the first stage
//! let mel = model.sample(&condition, &SampleOptions { seed: Some(42), ..Default::default() })?;
//!
//! // Write the three sub-graphs next to a manifest each
//! let report = model.export(&condition, &SampleOptions::default(), "out/", "utagoe")?;
//! ```
//!
//! ## Architecture
//!
//! 1. **GaussianDiffusion**: the checkpoint shape. Holds the denoiser and all
//!    per-timestep buffers at the top level. Consumed by
//!    [`GaussianDiffusion::build_submodules`], which moves each buffer into the
//!    module that reads it.
//!
//! 2. **DiffusionSampler**: the migrated decoder. Draws Gaussian noise, walks the
//!    timestep subsequence `K-1, ..., 0` (stride `speedup`) and calls:
//!    - [`DiffNet`](models::DiffNet) once per step to predict noise
//!    - [`AncestralPredictor`](models::AncestralPredictor) when `speedup == 1`
//!    - [`PlmsPredictor`](models::PlmsPredictor) otherwise, with a rolling history
//!      of the last three noise estimates
//!
//! 3. **MelRescaler**: maps the `[-1, 1]` sample back to the training mel range.
//!
//! The condition sequence comes from an external first stage; see
//! [`models::condition`] for the embedding glue around it.

pub mod export;
pub mod generation;
pub mod models;
pub mod profiling;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use export::{ArtifactExporter, ExportedGraph, SubGraph};

/// Re-exports for convenience
pub use generation::{DiffusionSampler, SamplingContext, SamplingStats};
pub use models::config::AcousticConfig;
pub use models::{BufferLoadReport, GaussianDiffusion};

/// Project name used for artifacts when none is given.
pub const DEFAULT_PROJECT: &str = "utagoe";

/// Per-call sampling options.
#[derive(Debug, Clone, Default)]
pub struct SampleOptions {
    /// Step multiplier; `None` uses the checkpoint's `pndm_speedup`
    pub speedup: Option<usize>,
    /// Seed for the initial and per-step noise; `None` draws a random seed
    pub seed: Option<u64>,
}

/// Outcome of [`AcousticModel::export`].
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub exported: Vec<ExportedGraph>,
    /// Graphs the capture run never reached (the noise predictor at `speedup == 1`)
    pub missing: Vec<SubGraph>,
    pub stats: SamplingStats,
    /// Mel produced by the capture run, `[1, frames, mel_bins]`
    pub mel: Tensor,
}

/// Summary of a loaded model, for logs and CLIs.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub timesteps: usize,
    pub k_step: usize,
    pub schedule: String,
    pub mel_bins: usize,
    pub hidden_size: usize,
    pub residual_layers: usize,
    pub residual_channels: usize,
    pub buffers_loaded: usize,
    pub buffers_computed: usize,
}

/// Acoustic diffusion decoder ready for sampling and export.
pub struct AcousticModel {
    config: AcousticConfig,
    sampler: DiffusionSampler,
    buffers: BufferLoadReport,
}

impl AcousticModel {
    /// Load `config.json` and `model.safetensors` from a local directory.
    pub fn from_pretrained<P: AsRef<Path>>(model_dir: P, device: Device) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        tracing::info!("Loading acoustic model from: {}", model_dir.display());

        let config = AcousticConfig::from_file(model_dir.join("config.json"))?;

        let model_path = model_dir.join("model.safetensors");
        if !model_path.exists() {
            anyhow::bail!(
                "Model weights not found at {}. Convert the checkpoint to safetensors first.",
                model_path.display()
            );
        }
        let weights = load_weights(&model_path, &device)?;
        Self::from_weights(config, &weights, &device)
    }

    /// Build from an in-memory checkpoint. Keys outside `denoise_fn.*` and the
    /// diffusion buffers are ignored.
    pub fn from_weights(
        config: AcousticConfig,
        weights: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let (diffusion, buffers) = GaussianDiffusion::from_weights(&config, weights, device)?;
        let sampler = diffusion.build_submodules()?;
        tracing::info!(
            "Acoustic model ready: {} mel bins, K_step {}, {} residual layers on {}",
            sampler.mel_bins(),
            sampler.k_step(),
            config.residual_layers,
            device_info(device)
        );
        Ok(Self {
            config,
            sampler,
            buffers,
        })
    }

    pub fn config(&self) -> &AcousticConfig {
        &self.config
    }

    pub fn sampler(&self) -> &DiffusionSampler {
        &self.sampler
    }

    pub fn device(&self) -> &Device {
        self.sampler.device()
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            timesteps: self.config.timesteps,
            k_step: self.sampler.k_step(),
            schedule: self.config.schedule_type.clone(),
            mel_bins: self.sampler.mel_bins(),
            hidden_size: self.config.hidden_size,
            residual_layers: self.config.residual_layers,
            residual_channels: self.config.residual_channels,
            buffers_loaded: self.buffers.loaded.len(),
            buffers_computed: self.buffers.computed.len(),
        }
    }

    fn resolve_speedup(&self, options: &SampleOptions) -> usize {
        options.speedup.unwrap_or(self.config.pndm_speedup)
    }

    /// Sample a mel spectrogram `[1, frames, mel_bins]`.
    pub fn sample(&self, condition: &Tensor, options: &SampleOptions) -> Result<Tensor> {
        Ok(self.sample_with_stats(condition, options)?.0)
    }

    pub fn sample_with_stats(
        &self,
        condition: &Tensor,
        options: &SampleOptions,
    ) -> Result<(Tensor, SamplingStats)> {
        let mut rng = SamplingContext::new(options.seed);
        log_seed(&rng);
        let condition = condition.to_device(self.device())?.to_dtype(DType::F32)?;
        self.sampler
            .sample_with_stats(&condition, self.resolve_speedup(options), &mut rng)
    }

    /// Run one sampling pass and write every reached sub-graph to `out_dir`.
    pub fn export<P: AsRef<Path>>(
        &self,
        condition: &Tensor,
        options: &SampleOptions,
        out_dir: P,
        project: &str,
    ) -> Result<ExportReport> {
        let speedup = self.resolve_speedup(options);
        let mut exporter = ArtifactExporter::new(out_dir, project)?;
        let mut rng = SamplingContext::new(options.seed);
        log_seed(&rng);
        let condition = condition.to_device(self.device())?.to_dtype(DType::F32)?;

        let (mel, stats) =
            self.sampler
                .sample_with_capture(&condition, speedup, &mut rng, &mut exporter)?;

        let missing = exporter.missing();
        for graph in &missing {
            tracing::warn!(
                "{} graph was not reached with speedup {} and was not exported",
                graph,
                speedup
            );
        }
        tracing::info!(
            "Exported {} graphs to {}",
            exporter.exported().len(),
            exporter.out_dir().display()
        );

        Ok(ExportReport {
            exported: exporter.into_exported(),
            missing,
            stats,
            mel,
        })
    }

    /// Uniform `[0, 1)` condition of the model's width, for export runs.
    pub fn example_condition(&self, frames: usize, rng: &mut SamplingContext) -> Result<Tensor> {
        rng.rand_uniform(
            (1, self.config.hidden_size, frames),
            0.0,
            1.0,
            self.device(),
        )
    }
}

/// Load weights from a safetensors file.
pub fn load_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path, device)?)
}

/// Filter weights by prefix, removing the prefix from keys.
pub(crate) fn filter_weights(
    weights: &HashMap<String, Tensor>,
    prefix: &str,
) -> HashMap<String, Tensor> {
    weights
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .map(|stripped| (stripped.to_string(), v.clone()))
        })
        .collect()
}

fn log_seed(rng: &SamplingContext) {
    let source = if rng.is_seeded() { "given" } else { "random" };
    tracing::debug!("Sampling seed {} ({})", rng.seed(), source);
}

/// Block until queued kernels on `device` have run.
///
/// Sampling time is measured after this, so GPU runs report completed work.
pub fn sync_device(device: &Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        _ => {
            let _: Vec<f32> = Tensor::zeros(1, DType::F32, device)?.to_vec1()?;
            Ok(())
        }
    }
}

/// Select the best available device.
///
/// Order: CUDA (feature `cuda`), Metal (feature `metal`), CPU.
///
/// ```rust,ignore
/// let device = diffsinger_acoustic::auto_device()?;
/// let model = AcousticModel::from_pretrained("path/to/model", device)?;
/// ```
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string into a [`Device`].
///
/// Supported formats: `"auto"`, `"cpu"`, `"cuda"`, `"cuda:N"`, `"metal"`.
///
/// # Errors
///
/// Returns an error if the string is unrecognized, the backend wasn't
/// compiled in, or hardware initialization fails.
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = match s.strip_prefix("cuda:") {
                    Some(idx) => idx
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid CUDA device index: {e}"))?,
                    None => 0,
                };
                Device::cuda_if_available(ordinal)
                    .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
            }
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("CUDA support not compiled in ('{s}'). Rebuild with --features cuda")
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
            }
            #[cfg(not(feature = "metal"))]
            anyhow::bail!("Metal support not compiled in. Rebuild with --features metal")
        }
        other => {
            anyhow::bail!("unknown device '{other}'. Supported: auto, cpu, cuda, cuda:N, metal")
        }
    }
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
