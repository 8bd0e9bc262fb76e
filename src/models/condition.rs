//! Condition embedder
//!
//! Turns phoneme tokens, durations and an F0 curve into the per-frame condition
//! sequence the denoiser reads. The text encoder itself sits behind
//! [`SequenceEncoder`]; this module owns the glue around it:
//!
//! 1. duration embedding fed to the encoder alongside the tokens
//! 2. length regulation (token sequence -> frame sequence via `mel2ph`)
//! 3. pitch embedding, discrete (coarse F0 bins) or continuous
//! 4. optional speaker embedding, by id or as a weighted mix
//!
//! Output shape is `[1, hidden, frames]`.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};

use super::config::AcousticConfig;

/// Number of coarse F0 bins, including the unvoiced bin.
pub const F0_BINS: usize = 256;
pub const F0_MIN: f32 = 50.0;
pub const F0_MAX: f32 = 1100.0;
/// Rows of the discrete pitch embedding table.
const PITCH_EMBED_ROWS: usize = 300;

fn hz_to_mel(f0: f32) -> f32 {
    1127.0 * (1.0 + f0 / 700.0).ln()
}

/// Quantize F0 (Hz) into coarse bins `1..=255`. Unvoiced frames (0 Hz) land in bin 1.
pub fn f0_to_coarse(f0: &[f32]) -> Vec<u32> {
    let mel_min = hz_to_mel(F0_MIN);
    let mel_max = hz_to_mel(F0_MAX);
    let scale = (F0_BINS - 2) as f32 / (mel_max - mel_min);
    f0.iter()
        .map(|&hz| {
            let mut mel = hz_to_mel(hz);
            if mel > 0.0 {
                mel = (mel - mel_min) * scale + 1.0;
            }
            mel.clamp(1.0, (F0_BINS - 1) as f32).round_ties_even() as u32
        })
        .collect()
}

/// Expand token durations into a frame -> token map.
///
/// `mel2ph[frame]` is the 1-based index of the token covering that frame.
/// Padding tokens (id 0) contribute no frames.
pub fn length_regulate(tokens: &[u32], durations: &[u32]) -> Result<Vec<u32>> {
    anyhow::ensure!(
        tokens.len() == durations.len(),
        "{} tokens but {} durations",
        tokens.len(),
        durations.len()
    );
    let mut mel2ph = Vec::with_capacity(durations.iter().map(|&d| d as usize).sum());
    for (i, (&token, &dur)) in tokens.iter().zip(durations).enumerate() {
        if token == 0 {
            continue;
        }
        mel2ph.extend(std::iter::repeat(i as u32 + 1).take(dur as usize));
    }
    Ok(mel2ph)
}

/// Pitch embedding variants selected by `f0_embed_type`.
pub enum PitchEmbedding {
    /// Embedding over coarse F0 bins
    Discrete(Embedding),
    /// Linear projection of `ln(1 + f0 / 700)`
    Continuous(Linear),
}

impl PitchEmbedding {
    pub fn new(kind: &str, hidden: usize, vb: VarBuilder) -> Result<Self> {
        match kind {
            "discrete" => Ok(Self::Discrete(embedding(PITCH_EMBED_ROWS, hidden, vb)?)),
            "continuous" => Ok(Self::Continuous(linear(1, hidden, vb)?)),
            other => anyhow::bail!("Unknown f0_embed_type '{}'", other),
        }
    }

    /// `f0`: Hz per frame -> [1, frames, hidden]
    pub fn forward(&self, f0: &[f32], device: &Device) -> Result<Tensor> {
        let frames = f0.len();
        match self {
            Self::Discrete(embed) => {
                let coarse = Tensor::from_vec(f0_to_coarse(f0), (1, frames), device)?;
                Ok(embed.forward(&coarse)?)
            }
            Self::Continuous(proj) => {
                let scaled: Vec<f32> = f0.iter().map(|&hz| (1.0 + hz / 700.0).ln()).collect();
                let scaled = Tensor::from_vec(scaled, (1, frames, 1), device)?;
                Ok(proj.forward(&scaled)?)
            }
        }
    }
}

/// Opaque text encoder: tokens [1, N] (U32) plus duration embedding
/// [1, N, hidden] -> encoded sequence [1, N, hidden].
pub trait SequenceEncoder {
    fn encode(&self, tokens: &Tensor, dur_embed: &Tensor) -> Result<Tensor>;
}

/// Speaker selection.
#[derive(Debug, Clone)]
pub enum SpeakerInput {
    Id(u32),
    /// One weight per speaker, mixed over the embedding table
    Mix(Vec<f32>),
}

/// Frame-level inputs for one utterance.
#[derive(Debug, Clone)]
pub struct ConditionInput<'a> {
    pub tokens: &'a [u32],
    pub durations: &'a [u32],
    pub f0: &'a [f32],
    pub speaker: Option<SpeakerInput>,
}

pub struct ConditionEmbedder<E: SequenceEncoder> {
    encoder: E,
    dur_embed: Linear,
    pitch_embed: PitchEmbedding,
    spk_embed: Option<Embedding>,
    hidden_size: usize,
    device: Device,
}

impl<E: SequenceEncoder> ConditionEmbedder<E> {
    /// `vb` points at the first-stage weights (`fs2.` in a full checkpoint).
    pub fn new(config: &AcousticConfig, encoder: E, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let dur_embed = linear(1, hidden, vb.pp("dur_embed"))?;
        let pitch_embed = PitchEmbedding::new(&config.f0_embed_type, hidden, vb.pp("pitch_embed"))?;
        let spk_embed = if config.use_spk_id {
            Some(embedding(config.num_spk, hidden, vb.pp("spk_embed_proj"))?)
        } else {
            None
        };
        Ok(Self {
            encoder,
            dur_embed,
            pitch_embed,
            spk_embed,
            hidden_size: hidden,
            device: vb.device().clone(),
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn speaker_embedding(&self, speaker: &SpeakerInput) -> Result<Tensor> {
        let Some(table) = &self.spk_embed else {
            anyhow::bail!("speaker given but the model has no speaker embedding");
        };
        let embeddings = table.embeddings();
        let num_spk = embeddings.dim(0)?;
        let row = match speaker {
            SpeakerInput::Id(id) => {
                anyhow::ensure!(
                    (*id as usize) < num_spk,
                    "speaker id {} out of range ({} speakers)",
                    id,
                    num_spk
                );
                embeddings.narrow(0, *id as usize, 1)?
            }
            SpeakerInput::Mix(weights) => {
                anyhow::ensure!(
                    weights.len() == num_spk,
                    "speaker mix has {} weights, model has {} speakers",
                    weights.len(),
                    num_spk
                );
                let w = Tensor::from_vec(weights.clone(), (1, num_spk), &self.device)?;
                w.matmul(&embeddings.to_dtype(DType::F32)?)?
            }
        };
        Ok(row.unsqueeze(0)?)
    }

    /// Build the `[1, hidden, frames]` condition, `frames = f0.len()`.
    pub fn forward(&self, input: &ConditionInput) -> Result<Tensor> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("condition_embed").entered();

        let frames = input.f0.len();
        let n_tokens = input.tokens.len();
        anyhow::ensure!(frames > 0, "F0 curve is empty");

        let mut mel2ph = length_regulate(input.tokens, input.durations)?;
        anyhow::ensure!(
            mel2ph.len() <= frames,
            "durations cover {} frames but F0 has {}",
            mel2ph.len(),
            frames
        );
        mel2ph.resize(frames, 0);

        let durations: Vec<f32> = input
            .tokens
            .iter()
            .zip(input.durations)
            .map(|(&t, &d)| if t == 0 { 0.0 } else { d as f32 })
            .collect();
        let durations = Tensor::from_vec(durations, (1, n_tokens, 1), &self.device)?;
        let dur_embed = self.dur_embed.forward(&durations)?;

        let tokens = Tensor::from_vec(input.tokens.to_vec(), (1, n_tokens), &self.device)?;
        let encoded = self.encoder.encode(&tokens, &dur_embed)?;
        anyhow::ensure!(
            encoded.dims() == [1, n_tokens, self.hidden_size],
            "encoder returned {:?}, expected [1, {}, {}]",
            encoded.dims(),
            n_tokens,
            self.hidden_size
        );

        // Row 0 is padding so mel2ph can index directly.
        let pad = Tensor::zeros((1, 1, self.hidden_size), encoded.dtype(), &self.device)?;
        let padded = Tensor::cat(&[&pad, &encoded], 1)?;
        let index = Tensor::new(mel2ph.as_slice(), &self.device)?;
        let decoder_inp = padded.index_select(&index, 1)?;

        let f0: Vec<f32> = input
            .f0
            .iter()
            .zip(&mel2ph)
            .map(|(&hz, &ph)| if ph > 0 { hz } else { 0.0 })
            .collect();
        let pitch = self.pitch_embed.forward(&f0, &self.device)?;
        let mut condition = (decoder_inp.to_dtype(DType::F32)? + pitch)?;

        if let Some(speaker) = &input.speaker {
            condition = condition.broadcast_add(&self.speaker_embedding(speaker)?)?;
        }

        tracing::trace!(
            "condition: {} tokens -> {} frames ({} voiced by durations)",
            n_tokens,
            frames,
            mel2ph.iter().filter(|&&p| p > 0).count()
        );

        Ok(condition.transpose(1, 2)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns the duration embedding unchanged.
    struct PassThrough;

    impl SequenceEncoder for PassThrough {
        fn encode(&self, _tokens: &Tensor, dur_embed: &Tensor) -> Result<Tensor> {
            Ok(dur_embed.clone())
        }
    }

    fn config(f0_embed_type: &str, use_spk_id: bool) -> AcousticConfig {
        AcousticConfig {
            hidden_size: 4,
            audio_num_mel_bins: 3,
            spec_min: vec![-5.0; 3],
            spec_max: vec![0.0; 3],
            f0_embed_type: f0_embed_type.to_string(),
            use_spk_id,
            num_spk: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_f0_to_coarse_bounds() {
        let coarse = f0_to_coarse(&[0.0, F0_MIN, F0_MAX, 2000.0, 10.0]);
        assert_eq!(coarse[0], 1);
        assert_eq!(coarse[1], 1);
        assert_eq!(coarse[2], 255);
        assert_eq!(coarse[3], 255);
        assert_eq!(coarse[4], 1);

        let mid = f0_to_coarse(&[220.0, 440.0]);
        assert!(mid[0] > 1 && mid[0] < mid[1] && mid[1] < 255);
    }

    #[test]
    fn test_length_regulate() {
        let mel2ph = length_regulate(&[5, 6, 0, 7], &[2, 1, 3, 2]).unwrap();
        assert_eq!(mel2ph, vec![1, 1, 2, 4, 4]);
        assert!(length_regulate(&[1, 2], &[1]).is_err());
    }

    #[test]
    fn test_unknown_pitch_embedding() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(PitchEmbedding::new("bucketed", 4, vb).is_err());
    }

    #[test]
    fn test_condition_follows_durations() {
        let device = Device::Cpu;
        let mut weights = std::collections::HashMap::new();
        weights.insert(
            "dur_embed.weight".to_string(),
            Tensor::ones((4, 1), DType::F32, &device).unwrap(),
        );
        weights.insert(
            "dur_embed.bias".to_string(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
        );
        weights.insert(
            "pitch_embed.weight".to_string(),
            Tensor::zeros((4, 1), DType::F32, &device).unwrap(),
        );
        weights.insert(
            "pitch_embed.bias".to_string(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let embedder = ConditionEmbedder::new(&config("continuous", false), PassThrough, vb).unwrap();
        assert_eq!(embedder.hidden_size(), 4);

        let input = ConditionInput {
            tokens: &[3, 4],
            durations: &[2, 3],
            f0: &[220.0; 7],
            speaker: None,
        };
        let cond = embedder.forward(&input).unwrap();
        assert_eq!(cond.dims(), &[1, 4, 7]);

        // Each frame carries its token's duration; frames past the durations are padding.
        let values: Vec<Vec<Vec<f32>>> = cond.to_vec3().unwrap();
        for row in &values[0] {
            assert_eq!(row, &vec![2.0, 2.0, 3.0, 3.0, 3.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn test_speaker_requires_table() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let embedder = ConditionEmbedder::new(&config("discrete", false), PassThrough, vb).unwrap();
        let input = ConditionInput {
            tokens: &[1],
            durations: &[2],
            f0: &[100.0, 100.0],
            speaker: Some(SpeakerInput::Id(0)),
        };
        assert!(embedder.forward(&input).is_err());
    }

    #[test]
    fn test_speaker_mix_weights_checked() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let embedder = ConditionEmbedder::new(&config("discrete", true), PassThrough, vb).unwrap();
        let mut input = ConditionInput {
            tokens: &[1],
            durations: &[2],
            f0: &[100.0, 100.0],
            speaker: Some(SpeakerInput::Mix(vec![0.5, 0.5])),
        };
        assert_eq!(embedder.forward(&input).unwrap().dims(), &[1, 4, 2]);

        input.speaker = Some(SpeakerInput::Mix(vec![1.0]));
        assert!(embedder.forward(&input).is_err());
        input.speaker = Some(SpeakerInput::Id(2));
        assert!(embedder.forward(&input).is_err());
    }

    #[test]
    fn test_durations_longer_than_f0() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let embedder = ConditionEmbedder::new(&config("discrete", false), PassThrough, vb).unwrap();
        let input = ConditionInput {
            tokens: &[1, 2],
            durations: &[2, 2],
            f0: &[100.0; 3],
            speaker: None,
        };
        assert!(embedder.forward(&input).is_err());
    }

    #[test]
    fn test_midi_checkpoint_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let config = AcousticConfig {
            use_midi: true,
            ..config("discrete", false)
        };
        let err = ConditionEmbedder::new(&config, PassThrough, vb)
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("MIDI-less"));
    }
}
