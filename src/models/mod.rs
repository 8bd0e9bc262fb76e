//! Neural network models for the DiffSinger acoustic decoder
//!
//! This module contains:
//! - `config`: Checkpoint hyperparameters
//! - `schedule`: Variance schedules and derived per-timestep coefficients
//! - `denoiser`: DiffNet, the noise-predicting residual network
//! - `predictor`: Ancestral (DDPM) and PLMS update rules
//! - `rescaler`: Normalized sample -> mel range
//! - `diffusion`: Checkpoint container and buffer migration
//! - `condition`: Condition sequence embedder around an opaque text encoder

pub mod condition;
pub mod config;
pub mod denoiser;
pub mod diffusion;
pub mod predictor;
pub mod rescaler;
pub mod schedule;

pub use condition::{
    f0_to_coarse, length_regulate, ConditionEmbedder, ConditionInput, PitchEmbedding,
    SequenceEncoder, SpeakerInput,
};
pub use config::AcousticConfig;
pub use denoiser::{DiffNet, DiffNetConfig};
pub use diffusion::{BufferLoadReport, GaussianDiffusion};
pub use predictor::{AncestralPredictor, NoiseHistory, PlmsPredictor, PlmsStage};
pub use rescaler::MelRescaler;
pub use schedule::{DiffusionSchedule, ScheduleKind};
