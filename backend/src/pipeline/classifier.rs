use std::sync::Arc;
use std::time::{Duration, Instant};

use shared::{ClassificationResult, ModelVariant};

use super::decode::{DecodeLimits, decode_jpeg};
use super::engine;
use super::error::PipelineError;
use super::executor::{DEFAULT_TIMEOUT, run_bounded};
use super::normalize::Normalizer;
use super::registry::ModelRegistry;
use super::result::decode_result;

/// Decode, normalize, predict and label one photo.
#[derive(Clone)]
pub struct Classifier {
    registry: Arc<ModelRegistry>,
    normalizer: Normalizer,
    limits: DecodeLimits,
    timeout: Duration,
}

impl Classifier {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            normalizer: Normalizer::default(),
            limits: DecodeLimits::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn limits(&self) -> &DecodeLimits {
        &self.limits
    }

    /// The whole pipeline, run to completion on the calling thread.
    pub fn classify_blocking(
        &self,
        variant: ModelVariant,
        image: &[u8],
    ) -> Result<ClassificationResult, PipelineError> {
        let start = Instant::now();
        let pixels = decode_jpeg(image, &self.limits)?;
        let tensor = self.normalizer.normalize(&pixels);
        drop(pixels);

        let model = self.registry.get_model(variant)?;
        let probabilities = engine::predict(&model, tensor)?;
        let result = decode_result(probabilities, model.labels())?;

        log::debug!(
            "Classified {} image as {} ({}%) in {:?}",
            variant,
            result.predicted_class,
            result.confidence_text(),
            start.elapsed()
        );
        Ok(result)
    }

    /// [`Self::run_with_timeout`] with the configured deadline.
    pub async fn run(
        &self,
        variant: ModelVariant,
        image: Vec<u8>,
    ) -> Result<ClassificationResult, PipelineError> {
        self.run_with_timeout(variant, image, self.timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        variant: ModelVariant,
        image: Vec<u8>,
        timeout: Duration,
    ) -> Result<ClassificationResult, PipelineError> {
        let classifier = self.clone();
        run_bounded(timeout, move || classifier.classify_blocking(variant, &image)).await
    }
}
