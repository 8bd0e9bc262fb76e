//! Diffusion sampling loop
//!
//! [`DiffusionSampler`] is the product of buffer migration: it owns the
//! denoiser and the three leaf modules, and is immutable afterwards. Every call
//! creates a [`SamplingSession`] holding the working sample, the PLMS history and
//! a borrowed RNG, so one sampler can serve concurrent calls.
//!
//! Dispatch: `speedup == 1` walks every timestep with the ancestral predictor;
//! `speedup > 1` walks every `speedup`-th timestep with the PLMS predictor.

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::Serialize;
use std::time::Instant;

use super::noise::SamplingContext;
use crate::export::GraphCapture;
use crate::models::denoiser::DiffNet;
use crate::models::predictor::{AncestralPredictor, NoiseHistory, PlmsPredictor};
use crate::models::rescaler::MelRescaler;

/// Timesteps visited for `k_step` and `speedup`: the multiples of `speedup`
/// below `k_step`, descending, ending at 0.
pub fn timesteps(k_step: usize, speedup: usize) -> Vec<usize> {
    if speedup == 0 {
        return Vec::new();
    }
    (0..k_step).step_by(speedup).rev().collect()
}

/// Number of denoiser evaluations for one call.
pub fn expected_network_calls(k_step: usize, speedup: usize) -> usize {
    let steps = timesteps(k_step, speedup).len();
    if speedup > 1 && steps > 0 {
        steps + 1
    } else {
        steps
    }
}

/// Progress of a [`SamplingSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPhase {
    /// Noise drawn, no step taken yet
    Initialized,
    /// `step` is the 0-based index of the last completed step
    Stepping { step: usize, timestep: usize },
    Done,
}

/// Counters from one sampling call.
#[derive(Debug, Clone, Serialize)]
pub struct SamplingStats {
    pub steps: usize,
    pub network_calls: usize,
    pub speedup: usize,
    pub frames: usize,
    pub sampling_ms: f64,
}

/// The migrated decoder: denoiser plus predictors and rescaler.
pub struct DiffusionSampler {
    denoiser: DiffNet,
    ancestral: AncestralPredictor,
    plms: PlmsPredictor,
    rescaler: MelRescaler,
    k_step: usize,
    device: Device,
}

impl DiffusionSampler {
    pub fn new(
        denoiser: DiffNet,
        ancestral: AncestralPredictor,
        plms: PlmsPredictor,
        rescaler: MelRescaler,
        k_step: usize,
        device: Device,
    ) -> Result<Self> {
        anyhow::ensure!(
            k_step > 0 && k_step <= ancestral.num_timesteps(),
            "K_step ({}) must be in 1..={}",
            k_step,
            ancestral.num_timesteps()
        );
        anyhow::ensure!(
            plms.num_timesteps() == ancestral.num_timesteps(),
            "predictor schedules disagree: {} vs {}",
            plms.num_timesteps(),
            ancestral.num_timesteps()
        );
        anyhow::ensure!(
            rescaler.mel_bins() == denoiser.config().in_dims,
            "rescaler has {} bins, denoiser {}",
            rescaler.mel_bins(),
            denoiser.config().in_dims
        );
        Ok(Self {
            denoiser,
            ancestral,
            plms,
            rescaler,
            k_step,
            device,
        })
    }

    pub fn denoiser(&self) -> &DiffNet {
        &self.denoiser
    }

    pub fn ancestral(&self) -> &AncestralPredictor {
        &self.ancestral
    }

    pub fn plms(&self) -> &PlmsPredictor {
        &self.plms
    }

    pub fn rescaler(&self) -> &MelRescaler {
        &self.rescaler
    }

    pub fn k_step(&self) -> usize {
        self.k_step
    }

    pub fn mel_bins(&self) -> usize {
        self.denoiser.config().in_dims
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Start a step-by-step sampling session.
    pub fn session<'a>(
        &'a self,
        condition: &Tensor,
        speedup: usize,
        rng: &'a mut SamplingContext,
        capture: Option<&'a mut dyn GraphCapture>,
    ) -> Result<SamplingSession<'a>> {
        SamplingSession::new(self, condition, speedup, rng, capture)
    }

    /// Sample a mel spectrogram `[1, frames, mel_bins]` from a condition
    /// `[1, hidden, frames]`.
    pub fn sample(
        &self,
        condition: &Tensor,
        speedup: usize,
        rng: &mut SamplingContext,
    ) -> Result<Tensor> {
        Ok(self.sample_with_stats(condition, speedup, rng)?.0)
    }

    pub fn sample_with_stats(
        &self,
        condition: &Tensor,
        speedup: usize,
        rng: &mut SamplingContext,
    ) -> Result<(Tensor, SamplingStats)> {
        self.session(condition, speedup, rng, None)?.finish()
    }

    /// Like [`sample_with_stats`](Self::sample_with_stats), handing the first
    /// denoiser call, the stage-0 PLMS extrapolation and the final rescale to
    /// `capture`.
    pub fn sample_with_capture<'a>(
        &'a self,
        condition: &Tensor,
        speedup: usize,
        rng: &'a mut SamplingContext,
        capture: &'a mut dyn GraphCapture,
    ) -> Result<(Tensor, SamplingStats)> {
        self.session(condition, speedup, rng, Some(capture))?.finish()
    }

    fn timestep_tensor(&self, t: usize) -> Result<Tensor> {
        Ok(Tensor::new(&[t as i64], &self.device)?)
    }
}

/// Denoiser calls for one session, with capture of the first one.
struct NetworkRunner<'a> {
    denoiser: &'a DiffNet,
    condition: Tensor,
    calls: usize,
    capture: Option<&'a mut dyn GraphCapture>,
}

impl NetworkRunner<'_> {
    fn denoise(&mut self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        let noise_pred = self.denoiser.forward(x, t, &self.condition)?;
        if self.calls == 0 {
            if let Some(capture) = self.capture.as_deref_mut() {
                capture.capture(self.denoiser, &[x, t, &self.condition], &[&noise_pred])?;
            }
        }
        self.calls += 1;
        Ok(noise_pred)
    }
}

/// State of one sampling call.
pub struct SamplingSession<'a> {
    sampler: &'a DiffusionSampler,
    runner: NetworkRunner<'a>,
    rng: &'a mut SamplingContext,
    speedup: usize,
    timesteps: Vec<usize>,
    x: Tensor,
    history: NoiseHistory,
    phase: SamplingPhase,
    started: Instant,
}

impl<'a> SamplingSession<'a> {
    fn new(
        sampler: &'a DiffusionSampler,
        condition: &Tensor,
        speedup: usize,
        rng: &'a mut SamplingContext,
        capture: Option<&'a mut dyn GraphCapture>,
    ) -> Result<Self> {
        anyhow::ensure!(speedup > 0, "speedup must be at least 1");
        let (batch, hidden, frames) = condition.dims3()?;
        anyhow::ensure!(batch == 1, "condition batch must be 1, got {}", batch);
        let expected_hidden = sampler.denoiser.config().encoder_hidden;
        anyhow::ensure!(
            hidden == expected_hidden,
            "condition width {} does not match hidden size {}",
            hidden,
            expected_hidden
        );
        anyhow::ensure!(frames > 0, "condition has no frames");
        if speedup > sampler.k_step {
            tracing::warn!(
                "speedup {} exceeds K_step {}; only t = 0 will be sampled",
                speedup,
                sampler.k_step
            );
        }

        let started = Instant::now();
        let steps = timesteps(sampler.k_step, speedup);
        let x = rng.randn((1, 1, sampler.mel_bins(), frames), &sampler.device)?;
        tracing::debug!(
            "Sampling {} frames: {} steps, speedup {}",
            frames,
            steps.len(),
            speedup
        );

        Ok(Self {
            sampler,
            runner: NetworkRunner {
                denoiser: &sampler.denoiser,
                condition: condition.clone(),
                calls: 0,
                capture,
            },
            rng,
            speedup,
            timesteps: steps,
            x,
            history: NoiseHistory::new(),
            phase: SamplingPhase::Initialized,
            started,
        })
    }

    pub fn phase(&self) -> SamplingPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == SamplingPhase::Done
    }

    /// Current working sample `[1, 1, mel_bins, frames]`.
    pub fn current(&self) -> &Tensor {
        &self.x
    }

    pub fn history(&self) -> &NoiseHistory {
        &self.history
    }

    pub fn network_calls(&self) -> usize {
        self.runner.calls
    }

    pub fn total_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Advance by one timestep; after the last one the phase becomes `Done`.
    pub fn step(&mut self) -> Result<SamplingPhase> {
        let index = match self.phase {
            SamplingPhase::Initialized => 0,
            SamplingPhase::Stepping { step, .. } => step + 1,
            SamplingPhase::Done => return Ok(SamplingPhase::Done),
        };
        let Some(&t) = self.timesteps.get(index) else {
            self.phase = SamplingPhase::Done;
            return Ok(self.phase);
        };

        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("diffusion_step", t).entered();

        self.x = if self.speedup > 1 {
            self.plms_step(t)?
        } else {
            self.ancestral_step(t)?
        };
        self.phase = SamplingPhase::Stepping {
            step: index,
            timestep: t,
        };
        tracing::trace!("{:?}", self.phase);
        Ok(self.phase)
    }

    fn ancestral_step(&mut self, t: usize) -> Result<Tensor> {
        let x = self.x.clone();
        let t = self.sampler.timestep_tensor(t)?;
        let noise_pred = self.runner.denoise(&x, &t)?;
        self.sampler.ancestral.step(&x, &noise_pred, &t, self.rng)
    }

    fn plms_step(&mut self, t: usize) -> Result<Tensor> {
        let sampler = self.sampler;
        let plms = &sampler.plms;
        let x = self.x.clone();
        let stage = self.history.stage();
        let t_prev = sampler.timestep_tensor(t.saturating_sub(self.speedup))?;
        let t = sampler.timestep_tensor(t)?;

        let noise_pred = self.runner.denoise(&x, &t)?;
        let runner = &mut self.runner;
        let noise_pred_prime = plms.combine(
            &x,
            &noise_pred,
            &t,
            &t_prev,
            &self.history,
            |x_pred, t_prev| {
                if let Some(capture) = runner.capture.as_deref_mut() {
                    capture.capture(plms, &[&x, &noise_pred, &t, t_prev], &[x_pred])?;
                }
                runner.denoise(x_pred, t_prev)
            },
        )?;
        tracing::trace!(
            "PLMS stage {} with {} estimates in history",
            stage.index(),
            self.history.len()
        );

        self.history.push(noise_pred);
        plms.extrapolate(&x, &noise_pred_prime, &t, &t_prev)
    }

    /// Run the remaining steps and rescale to mel `[1, frames, mel_bins]`.
    pub fn finish(mut self) -> Result<(Tensor, SamplingStats)> {
        while self.step()? != SamplingPhase::Done {}

        let mel = self.sampler.rescaler.forward(&self.x)?;
        if let Some(capture) = self.runner.capture.as_deref_mut() {
            capture.capture(&self.sampler.rescaler, &[&self.x], &[&mel])?;
        }
        crate::sync_device(&self.sampler.device)?;

        let stats = SamplingStats {
            steps: self.timesteps.len(),
            network_calls: self.runner.calls,
            speedup: self.speedup,
            frames: self.x.dims()[3],
            sampling_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        };
        tracing::debug!(
            "Sampled {} steps with {} network calls in {:.1}ms",
            stats.steps,
            stats.network_calls,
            stats.sampling_ms
        );
        Ok((mel, stats))
    }
}
