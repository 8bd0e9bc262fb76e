//! Export the acoustic decoder's sub-graphs
//!
//! Runs one sampling pass on a uniform-random condition and writes the
//! denoiser, PLMS noise predictor and mel rescaler as safetensors artifacts
//! with a JSON manifest each. `--verify` replays every artifact afterwards.
//!
//! Usage:
//!     cargo run --features cli --bin export_acoustic -- --model-dir model/ --out onnx/ --name utagoe
//!     cargo run --features cli --bin export_acoustic -- --model-dir model/ --speedup 20 --verify

use anyhow::Result;
use clap::Parser;
use std::path::Path;

use diffsinger_acoustic::export::replay_all;
use diffsinger_acoustic::{
    device_info, parse_device, AcousticModel, SampleOptions, SamplingContext, DEFAULT_PROJECT,
};

/// Export the diffusion decoder as replayable sub-graphs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model directory containing config.json and model.safetensors
    #[arg(short, long)]
    model_dir: String,

    /// Output directory for the artifacts
    #[arg(short, long, default_value = "onnx/assets")]
    out: String,

    /// Project name, used as the artifact file prefix
    #[arg(short, long, default_value = DEFAULT_PROJECT)]
    name: String,

    /// Step multiplier for the capture run (defaults to the checkpoint's pndm_speedup)
    #[arg(long)]
    speedup: Option<usize>,

    /// Frames in the example condition
    #[arg(short, long, default_value_t = 10)]
    frames: usize,

    /// Random seed for the example condition and the sampling noise
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Device for the capture run (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Replay the artifacts and check bit-identical outputs
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<()> {
    let _profiling_guard = diffsinger_acoustic::profiling::init();
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt::init();
    }

    let args = Args::parse();
    anyhow::ensure!(args.frames > 0, "--frames must be positive");
    if args.speedup == Some(0) {
        anyhow::bail!("--speedup must be positive");
    }

    let device = parse_device(&args.device)?;
    println!("=== Exporting acoustic decoder ===");
    println!("Model: {}", args.model_dir);
    println!("Device: {}", device_info(&device));

    let model = AcousticModel::from_pretrained(&args.model_dir, device.clone())?;
    println!("{}", serde_json::to_string_pretty(&model.summary())?);

    let mut rng = SamplingContext::new(Some(args.seed));
    let condition = model.example_condition(args.frames, &mut rng)?;

    let options = SampleOptions {
        speedup: args.speedup,
        seed: Some(args.seed),
    };
    let report = model.export(&condition, &options, &args.out, &args.name)?;

    println!(
        "\nSampling: {} steps, {} denoiser calls, speedup {}, {:.1} ms",
        report.stats.steps,
        report.stats.network_calls,
        report.stats.speedup,
        report.stats.sampling_ms
    );
    for graph in &report.exported {
        println!("  {} -> {}", graph.graph, graph.tensors.display());
    }
    for graph in &report.missing {
        println!("  {} not exported (not reached with this speedup)", graph);
    }

    if args.verify {
        println!("\n=== Verifying artifacts ===");
        let reports = replay_all(Path::new(&args.out), &args.name, &device)?;
        let mut failed = 0;
        for r in &reports {
            let status = if r.bit_identical { "OK" } else { "MISMATCH" };
            println!(
                "  {:<8} {} (max abs diff {:e}, output {:?})",
                status, r.name, r.max_abs_diff, r.output_shape
            );
            if !r.bit_identical {
                failed += 1;
            }
        }
        anyhow::ensure!(failed == 0, "{} artifact(s) failed replay", failed);
    }

    Ok(())
}
