//! Diffusion sampling
//!
//! This module provides:
//! - Per-run RNG via [`SamplingContext`] for reproducible initial and step noise
//! - The reverse-diffusion loop ([`DiffusionSampler`], [`SamplingSession`])
//! - Timestep subsequence helpers for a given speedup

mod noise;
pub mod sampler;

pub use noise::SamplingContext;
pub use sampler::{
    expected_network_calls, timesteps, DiffusionSampler, SamplingPhase, SamplingSession,
    SamplingStats,
};
