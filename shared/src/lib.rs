use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumCount, EnumIter, EnumString};

/// Labels of the apple fruit model, index-aligned with its output vector.
pub const APPLE_LABELS: [&str; 4] = ["Apple_scab", "Black_rot", "Cedar_apple_rust", "healthy"];

/// Labels of the leaf model, index-aligned with its output vector.
pub const LEAF_LABELS: [&str; 4] = ["1", "2", "3", "4"];

/// The two classification tasks served by the pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    EnumCount,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ModelVariant {
    #[serde(alias = "fruit")]
    #[strum(to_string = "apple", serialize = "fruit")]
    Apple,
    #[strum(to_string = "leaf")]
    Leaf,
}

impl ModelVariant {
    pub fn labels(self) -> &'static [&'static str] {
        match self {
            ModelVariant::Apple => &APPLE_LABELS,
            ModelVariant::Leaf => &LEAF_LABELS,
        }
    }

    pub fn all() -> [ModelVariant; 2] {
        [ModelVariant::Apple, ModelVariant::Leaf]
    }

    /// Stable slot index, used by per-variant caches.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Directory (relative to the model root) holding this variant's artifact.
    pub fn artifact_dir(self) -> &'static str {
        match self {
            ModelVariant::Apple => "apple",
            ModelVariant::Leaf => "leaf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub predicted_class: String,
    /// Percentage in `[0, 100]`, rounded to two decimals.
    pub confidence: f64,
    #[serde(rename = "probs")]
    pub probabilities: Vec<f32>,
}

impl ClassificationResult {
    pub fn confidence_text(&self) -> String {
        format!("{:.2}", self.confidence)
    }

    pub fn is_healthy(&self) -> bool {
        self.predicted_class.to_ascii_lowercase().contains("healthy")
    }
}

/// JSON body accepted by the base64 classification route.
#[derive(Serialize, Deserialize, Clone)]
pub struct InferenceRequest {
    pub image_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    #[serde(flatten)]
    pub result: ClassificationResult,
    pub model_type: ModelVariant,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::{EnumCount, IntoEnumIterator};

    #[test]
    fn test_variant_parsing() {
        assert_eq!(ModelVariant::from_str("apple").unwrap(), ModelVariant::Apple);
        assert_eq!(ModelVariant::from_str("Fruit").unwrap(), ModelVariant::Apple);
        assert_eq!(ModelVariant::from_str("LEAF").unwrap(), ModelVariant::Leaf);
        assert!(ModelVariant::from_str("pear").is_err());
        assert_eq!(ModelVariant::Apple.to_string(), "apple");
        assert_eq!(ModelVariant::Leaf.to_string(), "leaf");
    }

    #[test]
    fn test_labels_per_variant() {
        assert_eq!(ModelVariant::Apple.labels()[0], "Apple_scab");
        assert_eq!(ModelVariant::Leaf.labels(), &["1", "2", "3", "4"]);
        assert_eq!(ModelVariant::iter().count(), ModelVariant::COUNT);
        for variant in ModelVariant::all() {
            assert!(variant.index() < ModelVariant::COUNT);
        }
    }

    #[test]
    fn test_response_wire_shape() {
        let response = InferenceResponse {
            result: ClassificationResult {
                predicted_class: "healthy".into(),
                confidence: 97.5,
                probabilities: vec![0.0, 0.0, 0.025, 0.975],
            },
            model_type: ModelVariant::Apple,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["predictedClass"], "healthy");
        assert_eq!(json["modelType"], "apple");
        assert_eq!(json["probs"].as_array().unwrap().len(), 4);
        assert!(response.result.is_healthy());
        assert_eq!(response.result.confidence_text(), "97.50");
    }
}
