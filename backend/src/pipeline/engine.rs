use std::time::Duration;

use ndarray::{Array2, Array4};
use shared::ModelVariant;

use super::error::InferenceError;
use super::normalize::InputTensor;

/// Tolerance on the sum of a probability vector.
pub const PROBABILITY_EPSILON: f32 = 1e-3;

/// A frozen network exposing only its forward pass.
pub trait Predict: Send + Sync {
    /// Runs an NHWC batch through the network and returns `[batch, classes]`.
    fn forward(&self, input: Array4<f32>) -> Result<Array2<f32>, InferenceError>;

    fn output_width(&self) -> usize;

    fn describe(&self) -> String {
        "predictor".to_string()
    }
}

/// A predictor bound to its variant, as cached by the registry.
pub struct LoadedModel {
    variant: ModelVariant,
    predictor: Box<dyn Predict>,
    load_time: Duration,
}

impl LoadedModel {
    pub fn new(variant: ModelVariant, predictor: Box<dyn Predict>, load_time: Duration) -> Self {
        Self {
            variant,
            predictor,
            load_time,
        }
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn labels(&self) -> &'static [&'static str] {
        self.variant.labels()
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    pub fn describe(&self) -> String {
        self.predictor.describe()
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("variant", &self.variant)
            .field("predictor", &self.predictor.describe())
            .finish()
    }
}

/// Forward pass for a single image.
///
/// The tensor is consumed, and it and every intermediate activation are
/// dropped before this returns, on success and on error alike.
pub fn predict(model: &LoadedModel, tensor: InputTensor) -> Result<Vec<f32>, InferenceError> {
    let expected = model.labels().len();
    let output = model.predictor.forward(tensor.into_array())?;

    if output.nrows() != 1 || output.ncols() != expected {
        return Err(InferenceError::OutputWidth {
            expected,
            actual: output.len(),
        });
    }
    let probabilities: Vec<f32> = output.iter().copied().collect();
    drop(output);

    if let Some((index, &value)) = probabilities
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_finite() || **p < 0.0 || **p > 1.0 + PROBABILITY_EPSILON)
    {
        return Err(InferenceError::InvalidProbability { index, value });
    }
    let total: f32 = probabilities.iter().sum();
    if (total - 1.0).abs() > PROBABILITY_EPSILON {
        log::warn!(
            "{} model output sums to {:.5}; is the final activation softmax?",
            model.variant(),
            total
        );
    }

    Ok(probabilities)
}
