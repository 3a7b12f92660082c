use shared::ClassificationResult;

use super::error::InferenceError;

/// Index of the largest score; the first occurrence wins ties.
pub fn arg_max(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

/// Percentage rounded to two decimals.
pub fn to_percent(probability: f32) -> f64 {
    (probability as f64 * 100.0 * 100.0).round() / 100.0
}

/// Turns a probability vector into a labelled result.
pub fn decode_result(
    probabilities: Vec<f32>,
    labels: &[&str],
) -> Result<ClassificationResult, InferenceError> {
    if probabilities.len() != labels.len() {
        return Err(InferenceError::OutputWidth {
            expected: labels.len(),
            actual: probabilities.len(),
        });
    }
    let index = arg_max(&probabilities).ok_or(InferenceError::OutputWidth {
        expected: labels.len(),
        actual: 0,
    })?;

    Ok(ClassificationResult {
        predicted_class: labels[index].to_string(),
        confidence: to_percent(probabilities[index]),
        probabilities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ModelVariant;

    #[test]
    fn test_label_alignment() {
        let result =
            decode_result(vec![0.81, 0.05, 0.05, 0.09], ModelVariant::Apple.labels()).unwrap();
        assert_eq!(result.predicted_class, "Apple_scab");
        assert_eq!(result.confidence_text(), "81.00");
        assert_eq!(result.probabilities, vec![0.81, 0.05, 0.05, 0.09]);
    }

    #[test]
    fn test_tie_break_first_occurrence() {
        let result = decode_result(vec![0.5, 0.5, 0.0, 0.0], ModelVariant::Apple.labels()).unwrap();
        assert_eq!(result.predicted_class, "Apple_scab");
        assert_eq!(result.confidence, 50.0);

        let leaf = decode_result(vec![0.1, 0.3, 0.3, 0.3], ModelVariant::Leaf.labels()).unwrap();
        assert_eq!(leaf.predicted_class, "2");
    }

    #[test]
    fn test_rounding() {
        assert_eq!(to_percent(0.123456), 12.35);
        assert_eq!(to_percent(1.0), 100.0);
        assert_eq!(to_percent(0.0), 0.0);
        let result =
            decode_result(vec![0.0, 0.0, 0.33333, 0.66667], ModelVariant::Apple.labels()).unwrap();
        assert_eq!(result.predicted_class, "healthy");
        assert_eq!(result.confidence_text(), "66.67");
    }

    #[test]
    fn test_length_mismatch() {
        assert!(decode_result(vec![1.0], ModelVariant::Leaf.labels()).is_err());
        assert!(decode_result(vec![], &[]).is_err());
        assert_eq!(arg_max(&[]), None);
    }
}
