//! Sequential convolutional network evaluated with `ndarray`.
//!
//! Layers follow Keras semantics on NHWC tensors. Every shape is resolved
//! once at build time from the fixed input resolution, so a topology that
//! disagrees with its weights fails to load rather than failing mid-request.

use ndarray::{Array, Array1, Array2, Array4, Axis, Dimension, s};
use serde::Deserialize;

use super::artifact::{LayerSpec, WeightStore};
use super::engine::Predict;
use super::error::{InferenceError, ModelLoadError};
use super::normalize::CHANNELS;

const DEFAULT_BN_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Softmax,
}

impl Activation {
    fn parse(name: Option<&str>) -> Result<Self, ModelLoadError> {
        match name.unwrap_or("linear") {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "softmax" => Ok(Activation::Softmax),
            other => Err(ModelLoadError::Descriptor(format!(
                "unsupported activation `{}`",
                other
            ))),
        }
    }

    /// Applies in place; softmax normalizes along the last axis.
    fn apply<D: Dimension>(self, x: &mut Array<f32, D>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
            Activation::Sigmoid => x.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Softmax => {
                let last = Axis(x.ndim() - 1);
                for mut lane in x.lanes_mut(last) {
                    let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    lane.mapv_inplace(|v| (v - max).exp());
                    let sum = lane.sum();
                    lane.mapv_inplace(|v| v / sum);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Padding {
    #[default]
    Valid,
    Same,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Pair {
    One(usize),
    Two([usize; 2]),
}

impl Pair {
    fn get(self) -> (usize, usize) {
        match self {
            Pair::One(v) => (v, v),
            Pair::Two([a, b]) => (a, b),
        }
    }
}

fn unit_pair() -> Pair {
    Pair::One(1)
}

fn pool_pair() -> Pair {
    Pair::One(2)
}

fn yes() -> bool {
    true
}

fn bn_epsilon() -> f32 {
    DEFAULT_BN_EPSILON
}

#[derive(Debug, Deserialize)]
struct ConvConfig {
    filters: usize,
    kernel_size: Pair,
    #[serde(default = "unit_pair")]
    strides: Pair,
    #[serde(default = "unit_pair")]
    dilation_rate: Pair,
    #[serde(default)]
    padding: Padding,
    #[serde(default)]
    activation: Option<String>,
    #[serde(default = "yes")]
    use_bias: bool,
    #[serde(default)]
    data_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PoolConfig {
    #[serde(default = "pool_pair")]
    pool_size: Pair,
    #[serde(default)]
    strides: Option<Pair>,
    #[serde(default)]
    padding: Padding,
}

#[derive(Debug, Deserialize)]
struct DenseConfig {
    units: usize,
    #[serde(default)]
    activation: Option<String>,
    #[serde(default = "yes")]
    use_bias: bool,
}

#[derive(Debug, Deserialize)]
struct BatchNormConfig {
    #[serde(default = "bn_epsilon")]
    epsilon: f32,
    #[serde(default = "yes")]
    center: bool,
    #[serde(default = "yes")]
    scale: bool,
}

#[derive(Debug, Deserialize)]
struct ActivationConfig {
    activation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Spatial { h: usize, w: usize, c: usize },
    Flat(usize),
}

/// Sliding-window geometry, resolved against a known input size.
#[derive(Debug, Clone, Copy)]
struct Window {
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    pad_top: usize,
    pad_left: usize,
    out_h: usize,
    out_w: usize,
}

impl Window {
    fn resolve(
        (in_h, in_w): (usize, usize),
        (kh, kw): (usize, usize),
        (sh, sw): (usize, usize),
        padding: Padding,
    ) -> Result<Self, String> {
        if kh == 0 || kw == 0 || sh == 0 || sw == 0 {
            return Err("zero-sized window or stride".into());
        }
        let (out_h, pad_top) = axis_geometry(in_h, kh, sh, padding)?;
        let (out_w, pad_left) = axis_geometry(in_w, kw, sw, padding)?;
        Ok(Self {
            kh,
            kw,
            sh,
            sw,
            pad_top,
            pad_left,
            out_h,
            out_w,
        })
    }

    /// Input coordinate for output `o` and tap `k`, if inside the image.
    #[inline]
    fn source(o: usize, k: usize, stride: usize, pad: usize, len: usize) -> Option<usize> {
        (o * stride + k).checked_sub(pad).filter(|&i| i < len)
    }
}

fn axis_geometry(
    len: usize,
    k: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize), String> {
    match padding {
        Padding::Same => {
            let out = len.div_ceil(stride);
            let total = ((out - 1) * stride + k).saturating_sub(len);
            Ok((out, total / 2))
        }
        Padding::Valid => {
            if len < k {
                return Err(format!("window {} larger than input {}", k, len));
            }
            Ok(((len - k) / stride + 1, 0))
        }
    }
}

#[derive(Debug)]
struct Conv2d {
    /// `[kh * kw * in_c, out_c]`, rows ordered (ky, kx, c).
    kernel: Array2<f32>,
    bias: Option<Array1<f32>>,
    window: Window,
    activation: Activation,
}

impl Conv2d {
    fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let (batch, in_h, in_w, in_c) = x.dim();
        let w = self.window;
        let out_c = self.kernel.ncols();
        let mut out = Array4::<f32>::zeros((batch, w.out_h, w.out_w, out_c));

        for b in 0..batch {
            let mut cols = Array2::<f32>::zeros((w.out_h * w.out_w, self.kernel.nrows()));
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    let row = oy * w.out_w + ox;
                    for ky in 0..w.kh {
                        let Some(iy) = Window::source(oy, ky, w.sh, w.pad_top, in_h) else {
                            continue;
                        };
                        for kx in 0..w.kw {
                            let Some(ix) = Window::source(ox, kx, w.sw, w.pad_left, in_w) else {
                                continue;
                            };
                            let base = (ky * w.kw + kx) * in_c;
                            for c in 0..in_c {
                                cols[[row, base + c]] = x[[b, iy, ix, c]];
                            }
                        }
                    }
                }
            }

            let mut y = cols.dot(&self.kernel);
            if let Some(bias) = &self.bias {
                y += bias;
            }
            for (row, values) in y.outer_iter().enumerate() {
                out.slice_mut(s![b, row / w.out_w, row % w.out_w, ..])
                    .assign(&values);
            }
        }

        self.activation.apply(&mut out);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Max,
    Average,
}

#[derive(Debug)]
struct Pool2d {
    kind: PoolKind,
    window: Window,
}

impl Pool2d {
    /// Padded positions are excluded, matching Keras for both pool kinds.
    fn forward(&self, x: &Array4<f32>) -> Array4<f32> {
        let (batch, in_h, in_w, channels) = x.dim();
        let w = self.window;
        let mut out = Array4::<f32>::zeros((batch, w.out_h, w.out_w, channels));

        for b in 0..batch {
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    for c in 0..channels {
                        let mut acc = match self.kind {
                            PoolKind::Max => f32::NEG_INFINITY,
                            PoolKind::Average => 0.0,
                        };
                        let mut count = 0usize;
                        for ky in 0..w.kh {
                            let Some(iy) = Window::source(oy, ky, w.sh, w.pad_top, in_h) else {
                                continue;
                            };
                            for kx in 0..w.kw {
                                let Some(ix) = Window::source(ox, kx, w.sw, w.pad_left, in_w)
                                else {
                                    continue;
                                };
                                let v = x[[b, iy, ix, c]];
                                acc = match self.kind {
                                    PoolKind::Max => acc.max(v),
                                    PoolKind::Average => acc + v,
                                };
                                count += 1;
                            }
                        }
                        out[[b, oy, ox, c]] = match self.kind {
                            PoolKind::Max => acc,
                            PoolKind::Average => acc / count.max(1) as f32,
                        };
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug)]
struct Dense {
    kernel: Array2<f32>,
    bias: Option<Array1<f32>>,
    activation: Activation,
}

#[derive(Debug)]
enum Layer {
    Conv2d(Conv2d),
    Pool2d(Pool2d),
    GlobalAveragePool,
    Flatten,
    Dense(Dense),
    /// Folded batch norm: `x * scale + offset` on the channel axis.
    BatchNorm {
        scale: Array1<f32>,
        offset: Array1<f32>,
    },
    Activation(Activation),
}

enum Activations {
    Spatial(Array4<f32>),
    Flat(Array2<f32>),
}

/// A runnable Sequential model with a fixed `[size, size, 3]` input.
#[derive(Debug)]
pub struct Sequential {
    layers: Vec<Layer>,
    input_size: usize,
    output_width: usize,
}

impl Sequential {
    pub fn build(
        specs: &[LayerSpec],
        mut weights: WeightStore,
        input_size: usize,
    ) -> Result<Self, ModelLoadError> {
        let mut shape = Shape::Spatial {
            h: input_size,
            w: input_size,
            c: CHANNELS,
        };
        let mut layers = Vec::with_capacity(specs.len());

        for (index, spec) in specs.iter().enumerate() {
            if index == 0 {
                check_declared_input(spec, input_size)?;
            }
            let name = spec.name().to_string();
            let (layer, next) = match spec.class_name.as_str() {
                "InputLayer" | "Dropout" | "SpatialDropout2D" => continue,
                "Conv2D" => build_conv(spec, &name, shape, &mut weights)?,
                "MaxPooling2D" => build_pool(spec, &name, shape, PoolKind::Max)?,
                "AveragePooling2D" => build_pool(spec, &name, shape, PoolKind::Average)?,
                "GlobalAveragePooling2D" => match shape {
                    Shape::Spatial { c, .. } => (Layer::GlobalAveragePool, Shape::Flat(c)),
                    Shape::Flat(_) => return Err(expects_spatial(&name)),
                },
                "Flatten" => match shape {
                    Shape::Spatial { h, w, c } => (Layer::Flatten, Shape::Flat(h * w * c)),
                    Shape::Flat(n) => (Layer::Flatten, Shape::Flat(n)),
                },
                "Dense" => build_dense(spec, &name, shape, &mut weights)?,
                "BatchNormalization" => build_batch_norm(spec, &name, shape, &mut weights)?,
                "Activation" => {
                    let config: ActivationConfig = layer_config(spec)?;
                    (
                        Layer::Activation(Activation::parse(Some(&config.activation))?),
                        shape,
                    )
                }
                other => {
                    return Err(ModelLoadError::UnsupportedLayer {
                        class_name: other.to_string(),
                        name,
                    });
                }
            };
            layers.push(layer);
            shape = next;
        }

        let output_width = match shape {
            Shape::Flat(n) => n,
            Shape::Spatial { .. } => {
                return Err(ModelLoadError::Descriptor(
                    "model must end in a vector output".into(),
                ));
            }
        };
        if !weights.is_empty() {
            log::warn!("{} weight(s) in the manifest are not used by any layer", weights.len());
        }

        Ok(Self {
            layers,
            input_size,
            output_width,
        })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

impl Predict for Sequential {
    fn forward(&self, input: Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        let (_, h, w, c) = input.dim();
        if (h, w, c) != (self.input_size, self.input_size, CHANNELS) {
            return Err(InferenceError::InputShape {
                expected: vec![1, self.input_size, self.input_size, CHANNELS],
                actual: input.shape().to_vec(),
            });
        }

        let mut x = Activations::Spatial(input);
        for layer in &self.layers {
            x = match (layer, x) {
                (Layer::Conv2d(conv), Activations::Spatial(t)) => {
                    Activations::Spatial(conv.forward(&t))
                }
                (Layer::Pool2d(pool), Activations::Spatial(t)) => {
                    Activations::Spatial(pool.forward(&t))
                }
                (Layer::GlobalAveragePool, Activations::Spatial(t)) => {
                    let (_, h, w, _) = t.dim();
                    let pooled = t.sum_axis(Axis(1)).sum_axis(Axis(1)) / (h * w) as f32;
                    Activations::Flat(pooled)
                }
                (Layer::Flatten, Activations::Spatial(t)) => {
                    let batch = t.len_of(Axis(0));
                    let width = t.len() / batch.max(1);
                    let flat = Array2::from_shape_vec((batch, width), t.iter().copied().collect())
                        .map_err(|e| InferenceError::Backend(e.to_string()))?;
                    Activations::Flat(flat)
                }
                (Layer::Flatten, flat @ Activations::Flat(_)) => flat,
                (Layer::Dense(dense), Activations::Flat(t)) => {
                    let mut y = t.dot(&dense.kernel);
                    if let Some(bias) = &dense.bias {
                        y += bias;
                    }
                    dense.activation.apply(&mut y);
                    Activations::Flat(y)
                }
                (Layer::BatchNorm { scale, offset }, Activations::Spatial(mut t)) => {
                    t *= scale;
                    t += offset;
                    Activations::Spatial(t)
                }
                (Layer::BatchNorm { scale, offset }, Activations::Flat(mut t)) => {
                    t *= scale;
                    t += offset;
                    Activations::Flat(t)
                }
                (Layer::Activation(act), Activations::Spatial(mut t)) => {
                    act.apply(&mut t);
                    Activations::Spatial(t)
                }
                (Layer::Activation(act), Activations::Flat(mut t)) => {
                    act.apply(&mut t);
                    Activations::Flat(t)
                }
                (layer, _) => {
                    return Err(InferenceError::Backend(format!(
                        "layer {:?} received a tensor of the wrong rank",
                        layer_kind(layer)
                    )));
                }
            };
        }

        match x {
            Activations::Flat(out) => Ok(out),
            Activations::Spatial(_) => Err(InferenceError::Backend(
                "network ended with a spatial tensor".into(),
            )),
        }
    }

    fn output_width(&self) -> usize {
        self.output_width
    }

    fn describe(&self) -> String {
        format!(
            "sequential({} layers, {}x{} input)",
            self.layers.len(),
            self.input_size,
            self.input_size
        )
    }
}

fn layer_kind(layer: &Layer) -> &'static str {
    match layer {
        Layer::Conv2d(_) => "Conv2D",
        Layer::Pool2d(_) => "Pool2D",
        Layer::GlobalAveragePool => "GlobalAveragePooling2D",
        Layer::Flatten => "Flatten",
        Layer::Dense(_) => "Dense",
        Layer::BatchNorm { .. } => "BatchNormalization",
        Layer::Activation(_) => "Activation",
    }
}

fn layer_config<T: for<'de> Deserialize<'de>>(spec: &LayerSpec) -> Result<T, ModelLoadError> {
    serde_json::from_value(spec.config.clone())
        .map_err(|e| ModelLoadError::Descriptor(format!("{}: {}", spec.name(), e)))
}

fn expects_spatial(name: &str) -> ModelLoadError {
    ModelLoadError::Descriptor(format!("layer `{}` expects a spatial input", name))
}

/// A declared `batch_input_shape` must agree with the pipeline's tensor.
fn check_declared_input(spec: &LayerSpec, input_size: usize) -> Result<(), ModelLoadError> {
    let declared = spec
        .config
        .get("batch_input_shape")
        .or_else(|| spec.config.get("batch_shape"));
    let Some(declared) = declared else {
        return Ok(());
    };
    let dims: Vec<Option<usize>> = serde_json::from_value(declared.clone())
        .map_err(|e| ModelLoadError::Descriptor(format!("batch_input_shape: {}", e)))?;
    let expected = [input_size, input_size, CHANNELS];
    let actual: Vec<usize> = dims.iter().skip(1).map(|d| d.unwrap_or(0)).collect();
    if actual != expected {
        return Err(ModelLoadError::InputShape {
            expected: expected.to_vec(),
            actual,
        });
    }
    Ok(())
}

fn take_bias(
    weights: &mut WeightStore,
    name: &str,
    use_bias: bool,
    width: usize,
) -> Result<Option<Array1<f32>>, ModelLoadError> {
    if !use_bias {
        return Ok(None);
    }
    let bias = weights.take(&format!("{}/bias", name), &[width])?;
    into_dim(bias, name).map(Some)
}

fn into_dim<D: Dimension>(
    tensor: ndarray::ArrayD<f32>,
    name: &str,
) -> Result<Array<f32, D>, ModelLoadError> {
    tensor
        .into_dimensionality::<D>()
        .map_err(|e| ModelLoadError::Descriptor(format!("{}: {}", name, e)))
}

fn build_conv(
    spec: &LayerSpec,
    name: &str,
    shape: Shape,
    weights: &mut WeightStore,
) -> Result<(Layer, Shape), ModelLoadError> {
    let Shape::Spatial { h, w, c } = shape else {
        return Err(expects_spatial(name));
    };
    let config: ConvConfig = layer_config(spec)?;
    if config.dilation_rate.get() != (1, 1) {
        return Err(ModelLoadError::Descriptor(format!(
            "layer `{}`: dilated convolutions are not supported",
            name
        )));
    }
    if let Some(format) = config.data_format.as_deref() {
        if format != "channels_last" {
            return Err(ModelLoadError::Descriptor(format!(
                "layer `{}`: only channels_last is supported",
                name
            )));
        }
    }

    let (kh, kw) = config.kernel_size.get();
    let window = Window::resolve((h, w), (kh, kw), config.strides.get(), config.padding)
        .map_err(|e| ModelLoadError::Descriptor(format!("layer `{}`: {}", name, e)))?;

    let kernel = weights.take(&format!("{}/kernel", name), &[kh, kw, c, config.filters])?;
    let kernel = kernel
        .into_shape_with_order((kh * kw * c, config.filters))
        .map_err(|e| ModelLoadError::Descriptor(format!("{}: {}", name, e)))?;
    let bias = take_bias(weights, name, config.use_bias, config.filters)?;

    let layer = Layer::Conv2d(Conv2d {
        kernel,
        bias,
        window,
        activation: Activation::parse(config.activation.as_deref())?,
    });
    Ok((
        layer,
        Shape::Spatial {
            h: window.out_h,
            w: window.out_w,
            c: config.filters,
        },
    ))
}

fn build_pool(
    spec: &LayerSpec,
    name: &str,
    shape: Shape,
    kind: PoolKind,
) -> Result<(Layer, Shape), ModelLoadError> {
    let Shape::Spatial { h, w, c } = shape else {
        return Err(expects_spatial(name));
    };
    let config: PoolConfig = layer_config(spec)?;
    let pool = config.pool_size.get();
    let strides = config.strides.map(Pair::get).unwrap_or(pool);
    let window = Window::resolve((h, w), pool, strides, config.padding)
        .map_err(|e| ModelLoadError::Descriptor(format!("layer `{}`: {}", name, e)))?;
    Ok((
        Layer::Pool2d(Pool2d { kind, window }),
        Shape::Spatial {
            h: window.out_h,
            w: window.out_w,
            c,
        },
    ))
}

fn build_dense(
    spec: &LayerSpec,
    name: &str,
    shape: Shape,
    weights: &mut WeightStore,
) -> Result<(Layer, Shape), ModelLoadError> {
    let Shape::Flat(inputs) = shape else {
        return Err(ModelLoadError::Descriptor(format!(
            "layer `{}` expects a flattened input",
            name
        )));
    };
    let config: DenseConfig = layer_config(spec)?;
    let kernel = weights.take(&format!("{}/kernel", name), &[inputs, config.units])?;
    let layer = Layer::Dense(Dense {
        kernel: into_dim(kernel, name)?,
        bias: take_bias(weights, name, config.use_bias, config.units)?,
        activation: Activation::parse(config.activation.as_deref())?,
    });
    Ok((layer, Shape::Flat(config.units)))
}

fn build_batch_norm(
    spec: &LayerSpec,
    name: &str,
    shape: Shape,
    weights: &mut WeightStore,
) -> Result<(Layer, Shape), ModelLoadError> {
    let channels = match shape {
        Shape::Spatial { c, .. } => c,
        Shape::Flat(n) => n,
    };
    let config: BatchNormConfig = layer_config(spec)?;
    let mut param = |suffix: &str| -> Result<Array1<f32>, ModelLoadError> {
        into_dim(weights.take(&format!("{}/{}", name, suffix), &[channels])?, name)
    };

    let gamma = if config.scale {
        param("gamma")?
    } else {
        Array1::ones(channels)
    };
    let beta = if config.center {
        param("beta")?
    } else {
        Array1::zeros(channels)
    };
    let mean = param("moving_mean")?;
    let variance = param("moving_variance")?;

    let scale = &gamma / &variance.mapv(|v| (v + config.epsilon).sqrt());
    let offset = &beta - &(&mean * &scale);
    Ok((Layer::BatchNorm { scale, offset }, shape))
}
