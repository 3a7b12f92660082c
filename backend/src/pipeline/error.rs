use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("image payload too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("truncated JPEG stream")]
    Truncated,
    #[error("decoded image too large: {width}x{height} pixels")]
    PixelCountTooLarge { width: u32, height: u32 },
    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("pixel buffer length {actual} does not match {width}x{height}x3")]
    BufferLength {
        width: u32,
        height: u32,
        actual: usize,
    },
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Failure to construct a predictor for a variant. Cached by the registry,
/// hence `Clone` and string payloads.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelLoadError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("malformed model descriptor: {0}")]
    Descriptor(String),
    #[error("unsupported layer `{class_name}` ({name})")]
    UnsupportedLayer { class_name: String, name: String },
    #[error("missing weight `{0}`")]
    MissingWeight(String),
    #[error("weight `{name}` has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("weight shards hold {actual} bytes, manifest declares {expected}")]
    ShardSize { expected: usize, actual: usize },
    #[error("model input {actual:?} does not match pipeline input {expected:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("model emits {outputs} scores but variant has {labels} labels")]
    LabelMismatch { outputs: usize, labels: usize },
    #[error("inference backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("input tensor has shape {actual:?}, expected {expected:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("model produced {actual} scores, expected {expected}")]
    OutputWidth { expected: usize, actual: usize },
    #[error("model produced an invalid probability at index {index}: {value}")]
    InvalidProbability { index: usize, value: f32 },
    #[error("inference backend error: {0}")]
    Backend(String),
    #[error("inference task aborted: {0}")]
    Aborted(String),
}

/// Everything a classification request can fail with.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("model load error: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
}

impl PipelineError {
    /// Message that is safe to show to an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::Timeout(_) => "inference timed out",
            PipelineError::ModelLoad(_) => "model unavailable",
            PipelineError::Decode(_) | PipelineError::Inference(_) => "failed to process image",
        }
    }

    /// Only a timeout is worth retrying; every other failure is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Timeout(_))
    }
}
