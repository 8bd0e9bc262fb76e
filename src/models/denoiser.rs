//! Denoising network (DiffNet)
//!
//! A WaveNet-style stack of gated, dilated residual blocks that predicts the
//! noise in a noisy mel sample, conditioned on the encoder output and on the
//! diffusion timestep.
//!
//! Shapes:
//! - `spec`: `[batch, 1, mel_bins, frames]`
//! - `diffusion_step`: `[batch]` (I64 or F32)
//! - `cond`: `[batch, encoder_hidden, frames]`
//! - output: `[batch, 1, mel_bins, frames]`

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use super::config::AcousticConfig;

/// Hyperparameters of the denoising network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffNetConfig {
    /// Mel bins (input and output channels)
    pub in_dims: usize,
    /// Width of the condition sequence
    pub encoder_hidden: usize,
    pub residual_channels: usize,
    pub residual_layers: usize,
    pub dilation_cycle_length: usize,
}

impl DiffNetConfig {
    pub fn from_acoustic(config: &AcousticConfig) -> Self {
        Self {
            in_dims: config.audio_num_mel_bins,
            encoder_hidden: config.hidden_size,
            residual_channels: config.residual_channels,
            residual_layers: config.residual_layers,
            dilation_cycle_length: config.dilation_cycle_length,
        }
    }

    /// Dilation of residual block `layer`.
    pub fn dilation(&self, layer: usize) -> usize {
        1 << (layer % self.dilation_cycle_length)
    }
}

/// `x * tanh(softplus(x))`
pub fn mish(x: &Tensor) -> Result<Tensor> {
    let softplus = (x.exp()? + 1.0)?.log()?;
    Ok((x * softplus.tanh()?)?)
}

/// Sinusoidal timestep embedding.
pub struct SinusoidalPosEmb {
    /// Frequencies, shape [1, dim / 2]
    freqs: Tensor,
}

impl SinusoidalPosEmb {
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        anyhow::ensure!(dim >= 4 && dim % 2 == 0, "embedding dim must be even and >= 4");
        let half = dim / 2;
        let scale = -(10000f64.ln() / (half - 1) as f64) as f32;
        let freqs: Vec<f32> = (0..half).map(|i| (i as f32 * scale).exp()).collect();
        let freqs = Tensor::from_vec(freqs, (1, half), device)?;
        Ok(Self { freqs })
    }

    /// `steps`: [batch] -> [batch, dim]
    pub fn forward(&self, steps: &Tensor) -> Result<Tensor> {
        let batch = steps.elem_count();
        let steps = steps.to_dtype(DType::F32)?.reshape((batch, 1))?;
        let emb = steps.broadcast_mul(&self.freqs)?;
        Ok(Tensor::cat(&[emb.sin()?, emb.cos()?], 1)?)
    }
}

/// Gated residual block with a dilated convolution.
pub struct ResidualBlock {
    residual_channels: usize,
    dilation: usize,
    dilated_conv: Conv1d,
    diffusion_projection: Linear,
    conditioner_projection: Conv1d,
    output_projection: Conv1d,
}

impl ResidualBlock {
    pub fn new(
        encoder_hidden: usize,
        residual_channels: usize,
        dilation: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dilated = Conv1dConfig {
            padding: dilation,
            stride: 1,
            dilation,
            groups: 1,
            ..Default::default()
        };
        let pointwise = Conv1dConfig::default();

        Ok(Self {
            residual_channels,
            dilation,
            dilated_conv: conv1d(
                residual_channels,
                2 * residual_channels,
                3,
                dilated,
                vb.pp("dilated_conv"),
            )?,
            diffusion_projection: linear(
                residual_channels,
                residual_channels,
                vb.pp("diffusion_projection"),
            )?,
            conditioner_projection: conv1d(
                encoder_hidden,
                2 * residual_channels,
                1,
                pointwise,
                vb.pp("conditioner_projection"),
            )?,
            output_projection: conv1d(
                residual_channels,
                2 * residual_channels,
                1,
                pointwise,
                vb.pp("output_projection"),
            )?,
        })
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    /// Returns `(next_x, skip)`, both `[batch, residual_channels, frames]`.
    pub fn forward(
        &self,
        x: &Tensor,
        conditioner: &Tensor,
        diffusion_step: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let c = self.residual_channels;
        let step = self.diffusion_projection.forward(diffusion_step)?.unsqueeze(2)?;
        let conditioner = self.conditioner_projection.forward(conditioner)?;

        let y = x.broadcast_add(&step)?;
        let y = (self.dilated_conv.forward(&y)? + conditioner)?;

        let gate = y.narrow(1, 0, c)?;
        let filter = y.narrow(1, c, c)?;
        let y = (candle_nn::ops::sigmoid(&gate)? * filter.tanh()?)?;
        let y = self.output_projection.forward(&y)?;

        let residual = y.narrow(1, 0, c)?;
        let skip = y.narrow(1, c, c)?;
        let x = ((x + residual)? / std::f64::consts::SQRT_2)?;
        Ok((x, skip))
    }

    fn named_parameters(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        push_conv(out, &format!("{prefix}.dilated_conv"), &self.dilated_conv);
        push_linear(
            out,
            &format!("{prefix}.diffusion_projection"),
            &self.diffusion_projection,
        );
        push_conv(
            out,
            &format!("{prefix}.conditioner_projection"),
            &self.conditioner_projection,
        );
        push_conv(
            out,
            &format!("{prefix}.output_projection"),
            &self.output_projection,
        );
    }
}

fn push_conv(out: &mut Vec<(String, Tensor)>, name: &str, conv: &Conv1d) {
    out.push((format!("{name}.weight"), conv.weight().clone()));
    if let Some(bias) = conv.bias() {
        out.push((format!("{name}.bias"), bias.clone()));
    }
}

fn push_linear(out: &mut Vec<(String, Tensor)>, name: &str, layer: &Linear) {
    out.push((format!("{name}.weight"), layer.weight().clone()));
    if let Some(bias) = layer.bias() {
        out.push((format!("{name}.bias"), bias.clone()));
    }
}

/// The noise-prediction network.
pub struct DiffNet {
    config: DiffNetConfig,
    input_projection: Conv1d,
    diffusion_embedding: SinusoidalPosEmb,
    mlp_in: Linear,
    mlp_out: Linear,
    residual_layers: Vec<ResidualBlock>,
    skip_projection: Conv1d,
    output_projection: Conv1d,
}

impl DiffNet {
    /// Build the network, reading weights from `vb` (prefix already applied).
    pub fn new(config: DiffNetConfig, vb: VarBuilder) -> Result<Self> {
        anyhow::ensure!(config.residual_layers > 0, "residual_layers must be positive");
        anyhow::ensure!(
            config.dilation_cycle_length > 0,
            "dilation_cycle_length must be positive"
        );
        let c = config.residual_channels;
        let pointwise = Conv1dConfig::default();

        let input_projection = conv1d(config.in_dims, c, 1, pointwise, vb.pp("input_projection"))?;
        let diffusion_embedding = SinusoidalPosEmb::new(c, vb.device())?;
        let mlp_in = linear(c, 4 * c, vb.pp("mlp.0"))?;
        let mlp_out = linear(4 * c, c, vb.pp("mlp.2"))?;

        let residual_layers = (0..config.residual_layers)
            .map(|i| {
                ResidualBlock::new(
                    config.encoder_hidden,
                    c,
                    config.dilation(i),
                    vb.pp(format!("residual_layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let skip_projection = conv1d(c, c, 1, pointwise, vb.pp("skip_projection"))?;
        let output_projection =
            conv1d(c, config.in_dims, 1, pointwise, vb.pp("output_projection"))?;

        Ok(Self {
            config,
            input_projection,
            diffusion_embedding,
            mlp_in,
            mlp_out,
            residual_layers,
            skip_projection,
            output_projection,
        })
    }

    pub fn config(&self) -> &DiffNetConfig {
        &self.config
    }

    pub fn layers(&self) -> &[ResidualBlock] {
        &self.residual_layers
    }

    /// Predict the noise contained in `spec` at `diffusion_step`.
    pub fn forward(&self, spec: &Tensor, diffusion_step: &Tensor, cond: &Tensor) -> Result<Tensor> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("diffnet").entered();

        let x = spec.squeeze(1)?;
        let x = self.input_projection.forward(&x)?.relu()?;

        let step = self.diffusion_embedding.forward(diffusion_step)?;
        let step = self.mlp_in.forward(&step)?;
        let step = self.mlp_out.forward(&mish(&step)?)?;

        let mut x = x;
        let mut skips = Vec::with_capacity(self.residual_layers.len());
        for layer in &self.residual_layers {
            let (next, skip) = layer.forward(&x, cond, &step)?;
            x = next;
            skips.push(skip);
        }

        let x = Tensor::stack(&skips, 0)?.sum(0)?;
        let x = (x / (self.residual_layers.len() as f64).sqrt())?;
        let x = self.skip_projection.forward(&x)?.relu()?;
        let x = self.output_projection.forward(&x)?;
        Ok(x.unsqueeze(1)?)
    }

    /// All weights under their checkpoint names.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        push_conv(&mut out, "input_projection", &self.input_projection);
        push_linear(&mut out, "mlp.0", &self.mlp_in);
        push_linear(&mut out, "mlp.2", &self.mlp_out);
        for (i, layer) in self.residual_layers.iter().enumerate() {
            layer.named_parameters(&format!("residual_layers.{i}"), &mut out);
        }
        push_conv(&mut out, "skip_projection", &self.skip_projection);
        push_conv(&mut out, "output_projection", &self.output_projection);
        out
    }
}
