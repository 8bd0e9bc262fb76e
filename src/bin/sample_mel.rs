//! Sample a mel spectrogram from a saved condition sequence
//!
//! The condition is read from a safetensors file (key `condition`,
//! shape `[1, hidden_size, frames]`); the mel is written as `.npy`
//! with shape `[frames, mel_bins]`.
//!
//! Usage:
//!     cargo run --features cli --bin sample_mel -- --model-dir model/ --condition cond.safetensors
//!     cargo run --features cli --bin sample_mel -- --model-dir model/ --condition cond.safetensors --speedup 1 --seed 7

use anyhow::{Context, Result};
use candle_core::DType;
use clap::Parser;
use ndarray::Array2;
use ndarray_npy::WriteNpyExt;
use std::fs::File;
use std::io::BufWriter;

use diffsinger_acoustic::{device_info, parse_device, AcousticModel, SampleOptions};

/// Run the diffusion decoder on a condition sequence
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model directory containing config.json and model.safetensors
    #[arg(short, long)]
    model_dir: String,

    /// Safetensors file holding a `condition` tensor
    #[arg(short, long)]
    condition: String,

    /// Step multiplier (defaults to the checkpoint's pndm_speedup)
    #[arg(long)]
    speedup: Option<usize>,

    /// Random seed for reproducible sampling
    #[arg(short, long)]
    seed: Option<u64>,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "auto")]
    device: String,

    /// Output .npy path
    #[arg(short, long, default_value = "mel.npy")]
    output: String,
}

fn main() -> Result<()> {
    let _profiling_guard = diffsinger_acoustic::profiling::init();
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt::init();
    }

    let args = Args::parse();
    let device = parse_device(&args.device)?;
    println!("Device: {}", device_info(&device));

    let model = AcousticModel::from_pretrained(&args.model_dir, device.clone())?;

    let tensors = candle_core::safetensors::load(&args.condition, &device)
        .with_context(|| format!("Failed to read {}", args.condition))?;
    let condition = tensors
        .get("condition")
        .ok_or_else(|| anyhow::anyhow!("{} has no 'condition' tensor", args.condition))?;
    println!("Condition: {:?}", condition.dims());

    let options = SampleOptions {
        speedup: args.speedup,
        seed: args.seed,
    };
    let (mel, stats) = model.sample_with_stats(condition, &options)?;

    let mel = mel.squeeze(0)?.to_dtype(DType::F32)?;
    let (frames, bins) = mel.dims2()?;
    let data: Vec<f32> = mel.flatten_all()?.to_vec1()?;
    let array = Array2::from_shape_vec((frames, bins), data)?;
    let file = File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output))?;
    array.write_npy(BufWriter::new(file))?;

    println!(
        "Wrote {} ({} frames x {} bins) in {:.1} ms, {} denoiser calls",
        args.output, frames, bins, stats.sampling_ms, stats.network_calls
    );
    Ok(())
}
