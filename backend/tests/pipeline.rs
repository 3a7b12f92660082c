mod common;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use appledx::pipeline::result::to_percent;
use appledx::pipeline::{
    Classifier, DecodeError, DecodeLimits, ModelLoadError, ModelRegistry, PipelineError,
};
use common::{SlowLoader, classifier, gradient_jpeg, model_root, solid_jpeg, write_color_model};
use shared::{APPLE_LABELS, LEAF_LABELS, ModelVariant};

#[tokio::test]
async fn test_classifies_dominant_color() {
    let root = model_root();
    let classifier = classifier(root.path());

    let red = classifier
        .run(ModelVariant::Apple, solid_jpeg(320, 240, [255, 0, 0]))
        .await
        .unwrap();
    assert_eq!(red.predicted_class, "Apple_scab");
    assert!(red.confidence > 99.0, "confidence {}", red.confidence);

    let green = classifier
        .run(ModelVariant::Leaf, solid_jpeg(64, 64, [0, 255, 0]))
        .await
        .unwrap();
    assert_eq!(green.predicted_class, "2");

    let black = classifier
        .run(ModelVariant::Apple, solid_jpeg(100, 300, [0, 0, 0]))
        .await
        .unwrap();
    assert_eq!(black.predicted_class, "healthy");
    assert!(black.is_healthy());
}

#[tokio::test]
async fn test_probabilities_align_with_labels() {
    let root = model_root();
    let classifier = classifier(root.path());

    for (variant, labels) in [
        (ModelVariant::Apple, &APPLE_LABELS),
        (ModelVariant::Leaf, &LEAF_LABELS),
    ] {
        let result = classifier.run(variant, gradient_jpeg(500, 375)).await.unwrap();
        assert_eq!(result.probabilities.len(), labels.len());
        let sum: f32 = result.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3, "sum {}", sum);
        assert!(result.probabilities.iter().all(|p| (0.0..=1.0).contains(p)));

        let best = result
            .probabilities
            .iter()
            .enumerate()
            .fold(0, |best, (i, p)| if *p > result.probabilities[best] { i } else { best });
        assert_eq!(result.predicted_class, labels[best]);
        assert_eq!(result.confidence, to_percent(result.probabilities[best]));
    }
}

#[tokio::test]
async fn test_repeated_runs_are_identical() {
    let root = model_root();
    let classifier = classifier(root.path());
    let image = gradient_jpeg(257, 193);

    let first = classifier.run(ModelVariant::Apple, image.clone()).await.unwrap();
    let second = classifier.run(ModelVariant::Apple, image).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_model() {
    let root = model_root();
    let classifier = classifier(root.path());
    assert!(!classifier.registry().is_loaded(ModelVariant::Apple));

    let image = solid_jpeg(128, 128, [0, 0, 255]);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let classifier = classifier.clone();
            let image = image.clone();
            tokio::spawn(async move { classifier.run(ModelVariant::Apple, image).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert!(results.iter().all(|r| r == &results[0]));
    assert_eq!(results[0].predicted_class, "Cedar_apple_rust");

    let registry = classifier.registry();
    assert!(registry.is_loaded(ModelVariant::Apple));
    assert!(!registry.is_loaded(ModelVariant::Leaf));
    let a = registry.get_model(ModelVariant::Apple).unwrap();
    let b = registry.get_model(ModelVariant::Apple).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_slow_inference_times_out() {
    let registry = Arc::new(ModelRegistry::new(SlowLoader {
        delay: Duration::from_millis(500),
    }));
    let classifier = Classifier::new(registry).with_timeout(Duration::from_millis(20));

    let err = classifier
        .run(ModelVariant::Apple, solid_jpeg(32, 32, [10, 20, 30]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Timeout(d) if d == Duration::from_millis(20)));
    assert!(err.is_retryable());
    assert_eq!(err.user_message(), "inference timed out");

    // the same work completes when given enough time
    let result = classifier
        .run_with_timeout(
            ModelVariant::Apple,
            solid_jpeg(32, 32, [10, 20, 30]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(result.predicted_class, "Apple_scab");
    assert_eq!(result.confidence, 25.0);
}

#[tokio::test]
async fn test_invalid_images_are_decode_errors() {
    let root = model_root();
    let classifier = classifier(root.path());

    let err = classifier.run(ModelVariant::Apple, Vec::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Decode(DecodeError::Empty)));

    let mut png = Vec::new();
    image::RgbImage::new(8, 8)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    let err = classifier.run(ModelVariant::Apple, png).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Decode(DecodeError::UnsupportedFormat(_))
    ));
    assert!(!err.is_retryable());

    let mut truncated = solid_jpeg(64, 64, [1, 2, 3]);
    truncated.truncate(truncated.len() / 2);
    let err = classifier.run(ModelVariant::Apple, truncated).await.unwrap_err();
    assert!(matches!(err, PipelineError::Decode(_)));

    // decode failures never touch the model
    assert!(!classifier.registry().is_loaded(ModelVariant::Apple));
}

#[tokio::test]
async fn test_oversized_input_is_rejected() {
    let root = model_root();
    let classifier = classifier(root.path()).with_limits(DecodeLimits {
        max_image_bytes: 256,
        ..DecodeLimits::default()
    });

    let err = classifier
        .run(ModelVariant::Apple, gradient_jpeg(200, 200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Decode(DecodeError::TooLarge(_, 256))
    ));
}

#[tokio::test]
async fn test_missing_variant_does_not_affect_the_other() {
    let root = tempfile::tempdir().unwrap();
    write_color_model(root.path(), ModelVariant::Apple);
    let classifier = classifier(root.path());

    assert_eq!(classifier.registry().warm_up(), 1);

    let err = classifier
        .run(ModelVariant::Leaf, solid_jpeg(32, 32, [0, 0, 0]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ModelLoad(ModelLoadError::Io { .. })
    ));
    assert_eq!(err.user_message(), "model unavailable");

    // the artifact appearing later does not revive a failed variant
    write_color_model(root.path(), ModelVariant::Leaf);
    assert!(
        classifier
            .run(ModelVariant::Leaf, solid_jpeg(32, 32, [0, 0, 0]))
            .await
            .is_err()
    );

    assert!(
        classifier
            .run(ModelVariant::Apple, solid_jpeg(32, 32, [0, 0, 0]))
            .await
            .is_ok()
    );
}
