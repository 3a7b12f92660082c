//! TorchScript predictor, used when a variant directory ships `model.pt`.
//!
//! The scripted module receives the same NHWC `[1, size, size, 3]` tensor as
//! the layers-model path and is expected to return logits; softmax is applied
//! here.

use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array2, Array4};
use tch::{CModule, Device, Kind, Tensor};

use super::engine::Predict;
use super::error::{InferenceError, ModelLoadError};
use super::normalize::CHANNELS;

pub const SCRIPT_FILE: &str = "model.pt";

pub struct TorchScriptModel {
    module: Mutex<CModule>,
    device: Device,
    input_size: usize,
    output_width: usize,
}

impl TorchScriptModel {
    pub fn load(path: &Path, input_size: usize) -> Result<Self, ModelLoadError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(path, device)
            .map_err(|e| ModelLoadError::Backend(e.to_string()))?;

        let mut model = Self {
            module: Mutex::new(module),
            device,
            input_size,
            output_width: 0,
        };
        // Probe the head width once so the registry can check it against the labels.
        let probe = model
            .forward(Array4::zeros((1, input_size, input_size, CHANNELS)))
            .map_err(|e| ModelLoadError::Backend(e.to_string()))?;
        model.output_width = probe.ncols();
        Ok(model)
    }
}

impl Predict for TorchScriptModel {
    fn forward(&self, input: Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let values: Vec<f32> = input.iter().copied().collect();
        drop(input);

        let module = self
            .module
            .lock()
            .map_err(|_| InferenceError::Backend("TorchScript module lock poisoned".into()))?;
        let output = tch::no_grad(|| {
            let tensor = Tensor::from_slice(&values)
                .view(shape.as_slice())
                .to_device(self.device);
            module.forward_ts(&[tensor])
        });
        drop(module);
        let output = output.map_err(|e| InferenceError::Backend(e.to_string()))?;

        let output = output.softmax(-1, Kind::Float).to_device(Device::Cpu);
        let output_flat = output.to_kind(Kind::Float).view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut scores = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut scores, num_elements);

        Array2::from_shape_vec((1, num_elements), scores)
            .map_err(|e| InferenceError::Backend(e.to_string()))
    }

    fn output_width(&self) -> usize {
        self.output_width
    }

    fn describe(&self) -> String {
        format!(
            "torchscript({:?}, {}x{} input)",
            self.device, self.input_size, self.input_size
        )
    }
}
