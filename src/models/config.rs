//! Model configuration for DiffSinger acoustic checkpoints
//!
//! Mirrors the subset of the training hyperparameters (`config.json`) that the
//! diffusion decoder and the condition embedder read at construction time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::schedule::ScheduleKind;

/// Acoustic model hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcousticConfig {
    /// Length of the variance schedule
    #[serde(default = "default_timesteps")]
    pub timesteps: usize,

    /// Number of timesteps actually walked by the sampler (`K`)
    #[serde(default, rename = "K_step", alias = "k_step")]
    pub k_step: Option<usize>,

    /// Variance schedule shape ("linear" or "cosine")
    #[serde(default = "default_schedule_type")]
    pub schedule_type: String,

    /// Upper end of the linear schedule
    #[serde(default = "default_max_beta")]
    pub max_beta: f64,

    /// Default step multiplier for multi-step sampling
    #[serde(default = "default_pndm_speedup")]
    pub pndm_speedup: usize,

    /// Number of mel bins produced by the decoder
    #[serde(default = "default_mel_bins")]
    pub audio_num_mel_bins: usize,

    /// Number of leading bins kept from `spec_min` / `spec_max`
    #[serde(default)]
    pub keep_bins: Option<usize>,

    /// Encoder hidden size (width of the condition sequence)
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Channels inside the residual stack
    #[serde(default = "default_residual_channels")]
    pub residual_channels: usize,

    /// Number of residual blocks
    #[serde(default = "default_residual_layers")]
    pub residual_layers: usize,

    /// Dilation doubles up to `2^(cycle - 1)` then restarts
    #[serde(default = "default_dilation_cycle_length")]
    pub dilation_cycle_length: usize,

    /// Per-bin minimum of the normalized mel range
    #[serde(default)]
    pub spec_min: Vec<f32>,

    /// Per-bin maximum of the normalized mel range
    #[serde(default)]
    pub spec_max: Vec<f32>,

    /// Pitch embedding flavour ("discrete" or "continuous")
    #[serde(default = "default_f0_embed_type")]
    pub f0_embed_type: String,

    /// Whether the checkpoint carries a speaker id embedding table
    #[serde(default)]
    pub use_spk_id: bool,

    /// Size of the speaker id table
    #[serde(default = "default_num_spk")]
    pub num_spk: usize,

    /// MIDI-conditioned checkpoints are not supported
    #[serde(default)]
    pub use_midi: bool,

    /// Pitch embedding must be present
    #[serde(default = "default_true")]
    pub use_pitch_embed: bool,

    /// Phoneme vocabulary size (including padding id 0)
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
}

fn default_timesteps() -> usize {
    1000
}
fn default_schedule_type() -> String {
    "cosine".to_string()
}
fn default_max_beta() -> f64 {
    0.01
}
fn default_pndm_speedup() -> usize {
    10
}
fn default_mel_bins() -> usize {
    128
}
fn default_hidden_size() -> usize {
    256
}
fn default_residual_channels() -> usize {
    384
}
fn default_residual_layers() -> usize {
    20
}
fn default_dilation_cycle_length() -> usize {
    4
}
fn default_f0_embed_type() -> String {
    "discrete".to_string()
}
fn default_num_spk() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_vocab_size() -> usize {
    64
}

impl Default for AcousticConfig {
    fn default() -> Self {
        Self {
            timesteps: default_timesteps(),
            k_step: None,
            schedule_type: default_schedule_type(),
            max_beta: default_max_beta(),
            pndm_speedup: default_pndm_speedup(),
            audio_num_mel_bins: default_mel_bins(),
            keep_bins: None,
            hidden_size: default_hidden_size(),
            residual_channels: default_residual_channels(),
            residual_layers: default_residual_layers(),
            dilation_cycle_length: default_dilation_cycle_length(),
            spec_min: vec![-5.0; default_mel_bins()],
            spec_max: vec![0.0; default_mel_bins()],
            f0_embed_type: default_f0_embed_type(),
            use_spk_id: false,
            num_spk: default_num_spk(),
            use_midi: false,
            use_pitch_embed: true,
            vocab_size: default_vocab_size(),
        }
    }
}

impl AcousticConfig {
    /// Load configuration from a local JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Number of timesteps walked by the sampler, defaulting to the full schedule.
    pub fn k_step(&self) -> usize {
        self.k_step.unwrap_or(self.timesteps)
    }

    /// Number of mel bins kept from the normalization range.
    pub fn keep_bins(&self) -> usize {
        self.keep_bins.unwrap_or(self.audio_num_mel_bins)
    }

    /// Parsed schedule kind.
    pub fn schedule_kind(&self) -> Result<ScheduleKind> {
        self.schedule_type.parse()
    }

    /// Reject configurations the decoder cannot be built for.
    pub fn validate(&self) -> Result<()> {
        if self.use_midi || !self.use_pitch_embed {
            anyhow::bail!("Only checkpoints of MIDI-less mode are supported.");
        }
        self.schedule_kind()?;
        anyhow::ensure!(self.timesteps > 0, "timesteps must be positive");
        anyhow::ensure!(
            self.k_step() > 0 && self.k_step() <= self.timesteps,
            "K_step ({}) must be in 1..={} (timesteps)",
            self.k_step(),
            self.timesteps
        );
        anyhow::ensure!(
            self.residual_channels >= 4 && self.residual_channels % 2 == 0,
            "residual_channels must be an even number >= 4, got {}",
            self.residual_channels
        );
        anyhow::ensure!(
            self.dilation_cycle_length > 0,
            "dilation_cycle_length must be positive"
        );
        anyhow::ensure!(
            self.keep_bins() == self.audio_num_mel_bins,
            "keep_bins ({}) must equal audio_num_mel_bins ({})",
            self.keep_bins(),
            self.audio_num_mel_bins
        );
        anyhow::ensure!(
            self.spec_min.len() >= self.keep_bins() && self.spec_max.len() >= self.keep_bins(),
            "spec_min/spec_max need at least {} entries, got {}/{}",
            self.keep_bins(),
            self.spec_min.len(),
            self.spec_max.len()
        );
        match self.f0_embed_type.as_str() {
            "discrete" | "continuous" => {}
            other => anyhow::bail!(
                "f0_embed_type must be 'discrete' or 'continuous', got '{}'",
                other
            ),
        }
        Ok(())
    }
}
