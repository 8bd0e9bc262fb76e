//! Artifact replay
//!
//! Rebuilds a captured module from nothing but its own artifact, feeds it the
//! recorded example inputs and compares the result with the recorded outputs.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::path::Path;

use super::{GraphManifest, SubGraph, INPUT_PREFIX, OUTPUT_PREFIX, PARAM_PREFIX};
use crate::models::denoiser::{DiffNet, DiffNetConfig};
use crate::models::predictor::PlmsPredictor;
use crate::models::rescaler::MelRescaler;

/// Outcome of replaying one artifact.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub graph: SubGraph,
    pub name: String,
    pub bit_identical: bool,
    pub max_abs_diff: f32,
    pub output_shape: Vec<usize>,
}

struct Artifact {
    params: HashMap<String, Tensor>,
    inputs: HashMap<String, Tensor>,
    outputs: HashMap<String, Tensor>,
}

impl Artifact {
    fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load artifact {}", path.display()))?;

        let mut artifact = Self {
            params: HashMap::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
        };
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(PARAM_PREFIX) {
                artifact.params.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(INPUT_PREFIX) {
                artifact.inputs.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(OUTPUT_PREFIX) {
                artifact.outputs.insert(name.to_string(), tensor);
            } else {
                tracing::warn!("Ignoring unexpected tensor '{}' in artifact", key);
            }
        }
        Ok(artifact)
    }

    fn param(&self, name: &str) -> Result<Tensor> {
        self.params
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("artifact is missing parameter '{}'", name))
    }

    fn input(&self, name: &str) -> Result<&Tensor> {
        self.inputs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("artifact is missing input '{}'", name))
    }

    fn output(&self, name: &str) -> Result<&Tensor> {
        self.outputs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("artifact is missing output '{}'", name))
    }
}

fn run_graph(manifest: &GraphManifest, artifact: &Artifact, device: &Device) -> Result<Tensor> {
    match manifest.graph {
        SubGraph::Denoiser => {
            let config: DiffNetConfig = serde_json::from_value(manifest.attributes["diffnet"].clone())
                .context("manifest has no usable 'diffnet' attributes")?;
            let vb = VarBuilder::from_tensors(artifact.params.clone(), DType::F32, device);
            let net = DiffNet::new(config, vb)?;
            net.forward(
                artifact.input("noise")?,
                artifact.input("time")?,
                artifact.input("condition")?,
            )
        }
        SubGraph::NoisePredictor => {
            let plms = PlmsPredictor::new(artifact.param("alphas_cumprod")?)?;
            plms.extrapolate(
                artifact.input("noise")?,
                artifact.input("noise_pred")?,
                artifact.input("time")?,
                artifact.input("time_prev")?,
            )
        }
        SubGraph::MelExtractor => {
            let rescaler =
                MelRescaler::new(artifact.param("spec_min")?, artifact.param("spec_max")?)?;
            rescaler.forward(artifact.input("x")?)
        }
    }
}

fn compare(actual: &Tensor, expected: &Tensor) -> Result<(bool, f32)> {
    if actual.dims() != expected.dims() {
        return Ok((false, f32::INFINITY));
    }
    let a: Vec<f32> = actual.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let b: Vec<f32> = expected.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let identical = a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits());
    let max_abs_diff = a
        .iter()
        .zip(&b)
        .map(|(x, y)| (x - y).abs())
        .fold(0f32, f32::max);
    Ok((identical, max_abs_diff))
}

/// Replay `<dir>/<file_stem>.safetensors` using `<dir>/<file_stem>.json`.
pub fn replay_artifact<P: AsRef<Path>>(
    dir: P,
    file_stem: &str,
    device: &Device,
) -> Result<ReplayReport> {
    let dir = dir.as_ref();
    let manifest = GraphManifest::from_file(dir.join(format!("{file_stem}.json")))?;
    let artifact = Artifact::load(&dir.join(format!("{file_stem}.safetensors")), device)?;

    let output_name = manifest
        .outputs
        .first()
        .map(|o| o.name.clone())
        .ok_or_else(|| anyhow::anyhow!("manifest {} lists no outputs", file_stem))?;

    let actual = run_graph(&manifest, &artifact, device)?;
    let (bit_identical, max_abs_diff) = compare(&actual, artifact.output(&output_name)?)?;

    tracing::info!(
        "Replayed {}: bit_identical={} max_abs_diff={:e}",
        manifest.name,
        bit_identical,
        max_abs_diff
    );

    Ok(ReplayReport {
        graph: manifest.graph,
        name: manifest.name,
        bit_identical,
        max_abs_diff,
        output_shape: actual.dims().to_vec(),
    })
}

/// Replay every artifact of `project` present in `dir`.
pub fn replay_all<P: AsRef<Path>>(
    dir: P,
    project: &str,
    device: &Device,
) -> Result<Vec<ReplayReport>> {
    let dir = dir.as_ref();
    let mut reports = Vec::new();
    for graph in SubGraph::ALL {
        let stem = graph.file_stem(project);
        if !dir.join(format!("{stem}.json")).exists() {
            tracing::debug!("No {} artifact in {}", graph, dir.display());
            continue;
        }
        reports.push(replay_artifact(dir, &stem, device)?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ArtifactExporter, GraphCapture};

    #[test]
    fn test_replay_rescaler_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let rescaler = MelRescaler::new(
            Tensor::new(&[-5f32, -3.0, -1.5], &device).unwrap(),
            Tensor::new(&[0.5f32, 1.0, 2.0], &device).unwrap(),
        )
        .unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 1, 3, 8), &device).unwrap();
        let mel = rescaler.forward(&x).unwrap();

        let mut exporter = ArtifactExporter::new(dir.path(), "t").unwrap();
        exporter.capture(&rescaler, &[&x], &[&mel]).unwrap();

        let report = replay_artifact(dir.path(), "t_after", &device).unwrap();
        assert_eq!(report.graph, SubGraph::MelExtractor);
        assert!(report.bit_identical);
        assert_eq!(report.max_abs_diff, 0.0);
        assert_eq!(report.output_shape, vec![1, 8, 3]);
    }

    #[test]
    fn test_replay_detects_tampered_output() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let plms = PlmsPredictor::new(Tensor::new(&[0.99f32, 0.95, 0.9], &device).unwrap()).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 1, 2, 4), &device).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 1, 2, 4), &device).unwrap();
        let t = Tensor::new(&[2i64], &device).unwrap();
        let t_prev = Tensor::new(&[0i64], &device).unwrap();
        let wrong = (plms.extrapolate(&x, &noise, &t, &t_prev).unwrap() + 1.0).unwrap();

        let mut exporter = ArtifactExporter::new(dir.path(), "t").unwrap();
        exporter
            .capture(&plms, &[&x, &noise, &t, &t_prev], &[&wrong])
            .unwrap();

        let report = replay_artifact(dir.path(), "t_pred", &device).unwrap();
        assert!(!report.bit_identical);
        assert!((report.max_abs_diff - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_replay_all_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let reports = replay_all(dir.path(), "nothing", &Device::Cpu).unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn test_replay_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(replay_artifact(dir.path(), "absent_denoise", &Device::Cpu).is_err());
    }
}
