//! Benchmarks for the denoiser, the predictors and full sampling runs.
//!
//! Run with: `cargo bench -- sampling`

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use diffsinger_acoustic::generation::SamplingContext;
use diffsinger_acoustic::models::{
    AcousticConfig, DiffNet, DiffNetConfig, GaussianDiffusion, NoiseHistory,
};
use std::hint::black_box;

fn bench_config() -> AcousticConfig {
    AcousticConfig {
        audio_num_mel_bins: 128,
        hidden_size: 256,
        residual_channels: 256,
        residual_layers: 20,
        ..Default::default()
    }
}

fn random_diffusion(config: &AcousticConfig, device: &Device) -> GaussianDiffusion {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    GaussianDiffusion::new(config, vb).unwrap()
}

fn bench_denoiser(c: &mut Criterion) {
    let device = Device::Cpu;
    let config = bench_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let net = DiffNet::new(DiffNetConfig::from_acoustic(&config), vb).unwrap();
    let mut group = c.benchmark_group("denoiser");

    for frames in [100, 500] {
        let mut rng = SamplingContext::new(Some(42));
        let x = rng.randn((1, 1, 128, frames), &device).unwrap();
        let cond = rng.randn((1, 256, frames), &device).unwrap();
        let t = Tensor::new(&[500i64], &device).unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("frames_{frames}")),
            &frames,
            |b, _| b.iter(|| net.forward(black_box(&x), &t, &cond).unwrap()),
        );
    }
    group.finish();
}

fn bench_plms_combine(c: &mut Criterion) {
    let device = Device::Cpu;
    let sampler = random_diffusion(&bench_config(), &device)
        .build_submodules()
        .unwrap();
    let plms = sampler.plms();
    let mut rng = SamplingContext::new(Some(42));
    let x = rng.randn((1, 1, 128, 500), &device).unwrap();
    let noise = rng.randn((1, 1, 128, 500), &device).unwrap();
    let t = Tensor::new(&[500i64], &device).unwrap();
    let t_prev = Tensor::new(&[490i64], &device).unwrap();

    let mut history = NoiseHistory::new();
    for _ in 0..3 {
        history.push(rng.randn((1, 1, 128, 500), &device).unwrap());
    }

    c.bench_function("plms_stage3", |b| {
        b.iter(|| {
            plms.combine(&x, black_box(&noise), &t, &t_prev, &history, |_, _| {
                unreachable!("stage 3 does not probe")
            })
            .unwrap()
        })
    });
    c.bench_function("plms_extrapolate", |b| {
        b.iter(|| plms.extrapolate(&x, black_box(&noise), &t, &t_prev).unwrap())
    });
}

fn bench_sample(c: &mut Criterion) {
    let device = Device::Cpu;
    let config = AcousticConfig {
        residual_layers: 4,
        ..bench_config()
    };
    let sampler = random_diffusion(&config, &device)
        .build_submodules()
        .unwrap();
    let cond = Tensor::zeros((1, 256, 100), DType::F32, &device).unwrap();
    let mut group = c.benchmark_group("sample");
    group.sample_size(10);

    for speedup in [50, 100] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("speedup_{speedup}")),
            &speedup,
            |b, &speedup| {
                let mut ctx = SamplingContext::new(Some(42));
                b.iter(|| sampler.sample(black_box(&cond), speedup, &mut ctx).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_denoiser, bench_plms_combine, bench_sample);
criterion_main!(benches);
