//! Process-wide, write-once cache of loaded models.
//!
//! Each variant owns a `OnceLock` slot. Concurrent first callers block on the
//! same initialization, so a model is loaded at most once. The slot records
//! the outcome either way: a failed variant keeps failing with the same
//! error until the process restarts, without affecting the other variant.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use shared::ModelVariant;
use strum::EnumCount;

use super::artifact::ModelArtifact;
use super::engine::{LoadedModel, Predict};
use super::error::ModelLoadError;
use super::network::Sequential;
use super::normalize::DEFAULT_INPUT_SIZE;

/// Builds a predictor for a variant. Injected so tests can count and fake loads.
pub trait ModelLoader: Send + Sync {
    fn load(&self, variant: ModelVariant) -> Result<Box<dyn Predict>, ModelLoadError>;
}

/// Loads `<root>/<variant>/model.json` and its shards.
#[derive(Debug, Clone)]
pub struct ArtifactLoader {
    root: PathBuf,
    input_size: usize,
}

impl ArtifactLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            input_size: DEFAULT_INPUT_SIZE,
        }
    }

    pub fn with_input_size(mut self, input_size: usize) -> Self {
        self.input_size = input_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModelLoader for ArtifactLoader {
    fn load(&self, variant: ModelVariant) -> Result<Box<dyn Predict>, ModelLoadError> {
        let dir = self.root.join(variant.artifact_dir());

        #[cfg(feature = "torch")]
        {
            let script = dir.join(super::torch::SCRIPT_FILE);
            if script.exists() {
                let model = super::torch::TorchScriptModel::load(&script, self.input_size)?;
                return Ok(Box::new(model));
            }
        }

        let artifact = ModelArtifact::read(&dir)?;
        let parameters = artifact.weights.parameter_count();
        let network = Sequential::build(&artifact.layers, artifact.weights, self.input_size)?;
        log::info!(
            "Read {} model from {} ({} shard(s), {} layers, {} parameters)",
            variant,
            dir.display(),
            artifact.shard_count,
            network.layer_count(),
            parameters
        );
        Ok(Box::new(network))
    }
}

type Slot = OnceLock<Result<Arc<LoadedModel>, ModelLoadError>>;

pub struct ModelRegistry {
    loader: Box<dyn ModelLoader>,
    slots: [Slot; ModelVariant::COUNT],
}

impl ModelRegistry {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            slots: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Returns the cached model, loading it on first use.
    pub fn get_model(&self, variant: ModelVariant) -> Result<Arc<LoadedModel>, ModelLoadError> {
        self.slots[variant.index()]
            .get_or_init(|| self.load(variant))
            .clone()
    }

    pub fn is_loaded(&self, variant: ModelVariant) -> bool {
        matches!(self.slots[variant.index()].get(), Some(Ok(_)))
    }

    /// Loads every variant up front. Failures are logged and stay cached.
    pub fn warm_up(&self) -> usize {
        ModelVariant::all()
            .into_iter()
            .filter(|&variant| match self.get_model(variant) {
                Ok(_) => true,
                Err(e) => {
                    log::error!("Failed to preload {} model: {}", variant, e);
                    false
                }
            })
            .count()
    }

    fn load(&self, variant: ModelVariant) -> Result<Arc<LoadedModel>, ModelLoadError> {
        let start = Instant::now();
        let predictor = self.loader.load(variant).inspect_err(|e| {
            log::error!("Loading {} model failed: {}", variant, e);
        })?;

        let labels = variant.labels().len();
        if predictor.output_width() != labels {
            let err = ModelLoadError::LabelMismatch {
                outputs: predictor.output_width(),
                labels,
            };
            log::error!("Rejecting {} model: {}", variant, err);
            return Err(err);
        }

        let model = LoadedModel::new(variant, predictor, start.elapsed());
        log::info!(
            "{} model ready in {:.1} ms: {}",
            variant,
            model.load_time().as_secs_f64() * 1000.0,
            model.describe()
        );
        Ok(Arc::new(model))
    }
}
