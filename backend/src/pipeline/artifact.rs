//! Layers-model artifacts: a `model.json` descriptor plus binary weight shards.
//!
//! Shards of each manifest group are concatenated in declared order and the
//! result is sliced into little-endian `float32` weights, in manifest order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use serde::Deserialize;

use super::error::ModelLoadError;

pub const DESCRIPTOR_FILE: &str = "model.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    format: Option<String>,
    model_topology: serde_json::Value,
    weights_manifest: Vec<ManifestGroup>,
}

#[derive(Debug, Deserialize)]
struct ManifestGroup {
    paths: Vec<String>,
    weights: Vec<WeightSpec>,
}

#[derive(Debug, Deserialize)]
struct WeightSpec {
    name: String,
    shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    dtype: String,
    #[serde(default)]
    quantization: Option<serde_json::Value>,
}

fn default_dtype() -> String {
    "float32".to_string()
}

/// One layer entry of a Sequential topology.
#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
    pub class_name: String,
    pub config: serde_json::Value,
}

impl LayerSpec {
    pub fn name(&self) -> &str {
        self.config
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or(&self.class_name)
    }
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    class_name: String,
    config: SequentialConfig,
}

#[derive(Debug, Deserialize)]
struct SequentialConfig {
    layers: Vec<LayerSpec>,
}

/// Named weights reassembled from the shards.
#[derive(Debug, Default)]
pub struct WeightStore {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl WeightStore {
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    /// Remove a weight, checking it against the shape the topology implies.
    pub fn take(&mut self, name: &str, expected: &[usize]) -> Result<ArrayD<f32>, ModelLoadError> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| ModelLoadError::MissingWeight(name.to_string()))?;
        if tensor.shape() != expected {
            return Err(ModelLoadError::WeightShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }
        Ok(tensor)
    }
}

#[derive(Debug)]
pub struct ModelArtifact {
    pub layers: Vec<LayerSpec>,
    pub weights: WeightStore,
    pub shard_count: usize,
}

impl ModelArtifact {
    pub fn read(dir: &Path) -> Result<Self, ModelLoadError> {
        let descriptor_path = dir.join(DESCRIPTOR_FILE);
        let raw = fs::read_to_string(&descriptor_path).map_err(|e| io_error(&descriptor_path, e))?;
        let descriptor: Descriptor = serde_json::from_str(&raw)
            .map_err(|e| ModelLoadError::Descriptor(e.to_string()))?;

        if let Some(format) = descriptor.format.as_deref() {
            if format != "layers-model" {
                return Err(ModelLoadError::Descriptor(format!(
                    "unsupported model format `{}`",
                    format
                )));
            }
        }

        let layers = parse_topology(descriptor.model_topology)?;

        let mut weights = WeightStore::default();
        let mut shard_count = 0;
        for group in &descriptor.weights_manifest {
            let mut buffer = Vec::new();
            for shard in &group.paths {
                let path = shard_path(dir, shard)?;
                let bytes = fs::read(&path).map_err(|e| io_error(&path, e))?;
                buffer.extend_from_slice(&bytes);
                shard_count += 1;
            }
            slice_group(&buffer, &group.weights, &mut weights)?;
        }

        Ok(Self {
            layers,
            weights,
            shard_count,
        })
    }
}

/// Accepts `{class_name, config}`, the `{model_config: {...}}` wrapper and a
/// bare `{layers: [...]}` Sequential body.
fn parse_topology(topology: serde_json::Value) -> Result<Vec<LayerSpec>, ModelLoadError> {
    let model_config = match topology.get("model_config") {
        Some(inner) => inner.clone(),
        None => topology,
    };
    let layers = if model_config.get("layers").is_some() {
        let body: SequentialConfig = serde_json::from_value(model_config)
            .map_err(|e| ModelLoadError::Descriptor(e.to_string()))?;
        body.layers
    } else {
        let model: ModelConfig = serde_json::from_value(model_config)
            .map_err(|e| ModelLoadError::Descriptor(e.to_string()))?;
        if model.class_name != "Sequential" {
            return Err(ModelLoadError::Descriptor(format!(
                "only Sequential models are supported, got `{}`",
                model.class_name
            )));
        }
        model.config.layers
    };
    if layers.is_empty() {
        return Err(ModelLoadError::Descriptor("topology has no layers".into()));
    }
    Ok(layers)
}

fn slice_group(
    buffer: &[u8],
    specs: &[WeightSpec],
    store: &mut WeightStore,
) -> Result<(), ModelLoadError> {
    let mut expected = 0usize;
    for spec in specs {
        if spec.dtype != "float32" || spec.quantization.is_some() {
            return Err(ModelLoadError::Descriptor(format!(
                "weight `{}` uses unsupported dtype `{}`",
                spec.name, spec.dtype
            )));
        }
        expected += spec.shape.iter().product::<usize>() * 4;
    }
    if expected != buffer.len() {
        return Err(ModelLoadError::ShardSize {
            expected,
            actual: buffer.len(),
        });
    }

    let mut offset = 0;
    for spec in specs {
        let count: usize = spec.shape.iter().product();
        let values: Vec<f32> = buffer[offset..offset + count * 4]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        offset += count * 4;
        let tensor = ArrayD::from_shape_vec(IxDyn(&spec.shape), values)
            .map_err(|e| ModelLoadError::Descriptor(format!("{}: {}", spec.name, e)))?;
        store.insert(spec.name.clone(), tensor);
    }
    Ok(())
}

/// Shard paths are relative to the artifact directory and may not escape it.
fn shard_path(dir: &Path, shard: &str) -> Result<PathBuf, ModelLoadError> {
    let relative = Path::new(shard);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(ModelLoadError::Descriptor(format!(
            "shard path `{}` escapes the model directory",
            shard
        )));
    }
    Ok(dir.join(relative))
}

fn io_error(path: &Path, err: std::io::Error) -> ModelLoadError {
    ModelLoadError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
