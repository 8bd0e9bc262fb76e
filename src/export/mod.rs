//! Sub-graph export
//!
//! One representative sampling run captures the three leaf modules of the
//! decoder together with the exact tensors that flowed through them:
//!
//! | Graph | File stem | Inputs | Output |
//! |-------|-----------|--------|--------|
//! | [`SubGraph::Denoiser`] | `{project}_denoise` | `noise`, `time`, `condition` | `noise_pred` |
//! | [`SubGraph::NoisePredictor`] | `{project}_pred` | `noise`, `noise_pred`, `time`, `time_prev` | `noise_pred_o` |
//! | [`SubGraph::MelExtractor`] | `{project}_after` | `x` | `mel_out` |
//!
//! Each artifact is a `.safetensors` file (`param.*`, `input.*`, `output.*`)
//! next to a `.json` [`GraphManifest`]. Because buffers were migrated into the
//! leaf modules before capture, every artifact carries everything it needs and
//! can be replayed on its own (see [`replay_artifact`]).

mod replay;

pub use replay::{replay_all, replay_artifact, ReplayReport};

use anyhow::{Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::models::denoiser::DiffNet;
use crate::models::predictor::PlmsPredictor;
use crate::models::rescaler::MelRescaler;

/// Manifest format written next to every artifact.
pub const FORMAT_VERSION: u32 = 1;

pub const PARAM_PREFIX: &str = "param.";
pub const INPUT_PREFIX: &str = "input.";
pub const OUTPUT_PREFIX: &str = "output.";

/// The independently exported pieces of the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubGraph {
    Denoiser,
    NoisePredictor,
    MelExtractor,
}

impl SubGraph {
    pub const ALL: [SubGraph; 3] = [Self::Denoiser, Self::NoisePredictor, Self::MelExtractor];

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Denoiser => "denoise",
            Self::NoisePredictor => "pred",
            Self::MelExtractor => "after",
        }
    }

    pub fn file_stem(&self, project: &str) -> String {
        format!("{}_{}", project, self.suffix())
    }

    pub fn input_names(&self) -> &'static [&'static str] {
        match self {
            Self::Denoiser => &["noise", "time", "condition"],
            Self::NoisePredictor => &["noise", "noise_pred", "time", "time_prev"],
            Self::MelExtractor => &["x"],
        }
    }

    pub fn output_names(&self) -> &'static [&'static str] {
        match self {
            Self::Denoiser => &["noise_pred"],
            Self::NoisePredictor => &["noise_pred_o"],
            Self::MelExtractor => &["mel_out"],
        }
    }

    /// Axes allowed to change size at replay time (all frame axes).
    pub fn dynamic_axes(&self, name: &str) -> Vec<usize> {
        match (self, name) {
            (Self::Denoiser, "noise") => vec![3],
            (Self::Denoiser, "condition") => vec![2],
            (Self::NoisePredictor, "noise" | "noise_pred") => vec![3],
            (Self::MelExtractor, "x") => vec![3],
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for SubGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A module that can be written out as a standalone graph.
pub trait ExportableGraph {
    fn graph(&self) -> SubGraph;
    /// Every tensor the module reads besides its inputs.
    fn parameters(&self) -> Vec<(String, Tensor)>;
    /// Hyperparameters needed to rebuild the module.
    fn attributes(&self) -> serde_json::Value;
}

impl ExportableGraph for DiffNet {
    fn graph(&self) -> SubGraph {
        SubGraph::Denoiser
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.named_parameters()
    }

    fn attributes(&self) -> serde_json::Value {
        serde_json::json!({ "diffnet": self.config() })
    }
}

impl ExportableGraph for PlmsPredictor {
    fn graph(&self) -> SubGraph {
        SubGraph::NoisePredictor
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.named_buffers()
    }

    fn attributes(&self) -> serde_json::Value {
        serde_json::json!({ "timesteps": self.num_timesteps() })
    }
}

impl ExportableGraph for MelRescaler {
    fn graph(&self) -> SubGraph {
        SubGraph::MelExtractor
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        self.named_buffers()
    }

    fn attributes(&self) -> serde_json::Value {
        serde_json::json!({ "mel_bins": self.mel_bins() })
    }
}

/// Hook invoked by the sampler with the live tensors of a module call.
pub trait GraphCapture {
    fn capture(
        &mut self,
        module: &dyn ExportableGraph,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Result<()>;
}

/// Name, dtype and example shape of one graph input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dynamic_axes: Vec<usize>,
}

/// JSON side-car describing an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphManifest {
    pub format_version: u32,
    pub graph: SubGraph,
    pub name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub parameters: Vec<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl GraphManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest from {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest from {}", path.display()))?;
        anyhow::ensure!(
            manifest.format_version == FORMAT_VERSION,
            "Unsupported manifest version {} in {} (expected {})",
            manifest.format_version,
            path.display(),
            FORMAT_VERSION
        );
        Ok(manifest)
    }
}

/// Files written for one graph.
#[derive(Debug, Clone)]
pub struct ExportedGraph {
    pub graph: SubGraph,
    pub name: String,
    pub tensors: PathBuf,
    pub manifest: PathBuf,
}

fn tensor_spec(graph: SubGraph, name: &str, tensor: &Tensor) -> TensorSpec {
    TensorSpec {
        name: name.to_string(),
        dtype: tensor.dtype().as_str().to_string(),
        shape: tensor.dims().to_vec(),
        dynamic_axes: graph.dynamic_axes(name),
    }
}

/// Writes each sub-graph the first time it is captured.
pub struct ArtifactExporter {
    out_dir: PathBuf,
    project: String,
    captured: HashSet<SubGraph>,
    exported: Vec<ExportedGraph>,
}

impl ArtifactExporter {
    pub fn new<P: AsRef<Path>>(out_dir: P, project: &str) -> Result<Self> {
        anyhow::ensure!(!project.is_empty(), "project name must not be empty");
        let out_dir = out_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create export directory {}", out_dir.display()))?;
        Ok(Self {
            out_dir,
            project: project.to_string(),
            captured: HashSet::new(),
            exported: Vec::new(),
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn is_captured(&self, graph: SubGraph) -> bool {
        self.captured.contains(&graph)
    }

    pub fn exported(&self) -> &[ExportedGraph] {
        &self.exported
    }

    /// Graphs never reached during the capture run.
    pub fn missing(&self) -> Vec<SubGraph> {
        SubGraph::ALL
            .into_iter()
            .filter(|g| !self.captured.contains(g))
            .collect()
    }

    pub fn into_exported(self) -> Vec<ExportedGraph> {
        self.exported
    }

    fn write(
        &mut self,
        module: &dyn ExportableGraph,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Result<ExportedGraph> {
        let graph = module.graph();
        let input_names = graph.input_names();
        let output_names = graph.output_names();
        anyhow::ensure!(
            inputs.len() == input_names.len() && outputs.len() == output_names.len(),
            "{} graph expects {} inputs / {} outputs, got {} / {}",
            graph,
            input_names.len(),
            output_names.len(),
            inputs.len(),
            outputs.len()
        );

        let name = graph.file_stem(&self.project);
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let mut parameters = Vec::new();
        for (param, tensor) in module.parameters() {
            tensors.insert(format!("{PARAM_PREFIX}{param}"), tensor.contiguous()?);
            parameters.push(param);
        }
        for (input, tensor) in input_names.iter().zip(inputs) {
            tensors.insert(format!("{INPUT_PREFIX}{input}"), tensor.contiguous()?);
        }
        for (output, tensor) in output_names.iter().zip(outputs) {
            tensors.insert(format!("{OUTPUT_PREFIX}{output}"), tensor.contiguous()?);
        }

        let manifest = GraphManifest {
            format_version: FORMAT_VERSION,
            graph,
            name: name.clone(),
            inputs: input_names
                .iter()
                .zip(inputs)
                .map(|(n, t)| tensor_spec(graph, n, t))
                .collect(),
            outputs: output_names
                .iter()
                .zip(outputs)
                .map(|(n, t)| tensor_spec(graph, n, t))
                .collect(),
            parameters,
            attributes: module.attributes(),
        };

        let tensors_path = self.out_dir.join(format!("{name}.safetensors"));
        candle_core::safetensors::save(&tensors, &tensors_path)
            .with_context(|| format!("Failed to write {}", tensors_path.display()))?;

        let manifest_path = self.out_dir.join(format!("{name}.json"));
        let json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&manifest_path, json)
            .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

        tracing::info!(
            "Exported {} graph to {} ({} parameters)",
            graph,
            tensors_path.display(),
            manifest.parameters.len()
        );

        Ok(ExportedGraph {
            graph,
            name,
            tensors: tensors_path,
            manifest: manifest_path,
        })
    }
}

impl GraphCapture for ArtifactExporter {
    fn capture(
        &mut self,
        module: &dyn ExportableGraph,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Result<()> {
        let graph = module.graph();
        if self.captured.contains(&graph) {
            tracing::debug!("{} graph already captured, skipping", graph);
            return Ok(());
        }
        let exported = self.write(module, inputs, outputs)?;
        self.captured.insert(graph);
        self.exported.push(exported);
        Ok(())
    }
}
