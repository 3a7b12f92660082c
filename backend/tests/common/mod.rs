#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use appledx::pipeline::{
    ArtifactLoader, Classifier, InferenceError, ModelLoadError, ModelLoader, ModelRegistry,
    Predict,
};
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use ndarray::{Array2, Array4};
use serde_json::json;
use shared::ModelVariant;
use tempfile::TempDir;

/// Writes a small layers-model that scores the mean red, green and blue
/// intensity of a photo as classes 0, 1 and 2.
pub fn write_color_model(root: &Path, variant: ModelVariant) {
    let dir = root.join(variant.artifact_dir());
    fs::create_dir_all(&dir).unwrap();

    let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
    let head_kernel = [
        10.0, 0.0, 0.0, 0.0, //
        0.0, 10.0, 0.0, 0.0, //
        0.0, 0.0, 10.0, 0.0,
    ];
    let head_bias = [0.0, 0.0, 0.0, 1.0];
    let bytes: Vec<u8> = identity
        .iter()
        .chain(&head_kernel)
        .chain(&head_bias)
        .flat_map(|v: &f32| v.to_le_bytes())
        .collect();
    fs::write(dir.join("group1-shard1of1.bin"), bytes).unwrap();

    let descriptor = json!({
        "format": "layers-model",
        "generatedBy": "keras v2.15.0",
        "modelTopology": {
            "class_name": "Sequential",
            "config": {"name": "color", "layers": [
                {"class_name": "InputLayer", "config": {
                    "name": "input", "batch_input_shape": [null, 224, 224, 3]
                }},
                {"class_name": "AveragePooling2D", "config": {
                    "name": "pool", "pool_size": [8, 8]
                }},
                {"class_name": "Conv2D", "config": {
                    "name": "mix", "filters": 3, "kernel_size": [1, 1], "use_bias": false
                }},
                {"class_name": "GlobalAveragePooling2D", "config": {"name": "gap"}},
                {"class_name": "Dropout", "config": {"name": "drop", "rate": 0.5}},
                {"class_name": "Dense", "config": {
                    "name": "head", "units": 4, "activation": "softmax"
                }}
            ]}
        },
        "weightsManifest": [{
            "paths": ["group1-shard1of1.bin"],
            "weights": [
                {"name": "mix/kernel", "shape": [1, 1, 3, 3], "dtype": "float32"},
                {"name": "head/kernel", "shape": [3, 4], "dtype": "float32"},
                {"name": "head/bias", "shape": [4], "dtype": "float32"}
            ]
        }]
    });
    fs::write(dir.join("model.json"), descriptor.to_string()).unwrap();
}

/// A model directory holding the color model for both variants.
pub fn model_root() -> TempDir {
    let root = tempfile::tempdir().unwrap();
    for variant in ModelVariant::all() {
        write_color_model(root.path(), variant);
    }
    root
}

pub fn classifier(root: &Path) -> Classifier {
    Classifier::new(Arc::new(ModelRegistry::new(ArtifactLoader::new(root))))
}

pub fn solid_jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 95)
        .encode_image(&img)
        .unwrap();
    out
}

pub fn gradient_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 64])
    });
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode_image(&img)
        .unwrap();
    out
}

/// Uniform over four classes, after sleeping for `delay`.
pub struct SlowModel {
    pub delay: Duration,
}

impl Predict for SlowModel {
    fn forward(&self, input: Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        std::thread::sleep(self.delay);
        Ok(Array2::from_elem((input.shape()[0], 4), 0.25))
    }

    fn output_width(&self) -> usize {
        4
    }
}

pub struct SlowLoader {
    pub delay: Duration,
}

impl ModelLoader for SlowLoader {
    fn load(&self, _variant: ModelVariant) -> Result<Box<dyn Predict>, ModelLoadError> {
        Ok(Box::new(SlowModel { delay: self.delay }))
    }
}
