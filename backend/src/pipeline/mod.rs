//! Photo classification pipeline.
//!
//! `decode` turns JPEG bytes into RGB pixels, `normalize` resizes them into
//! the model's input tensor, `registry` hands out cached models, `engine`
//! runs the forward pass, `result` labels the output and `executor` bounds
//! the whole run by a deadline. `Classifier` wires the stages together.

pub mod artifact;
pub mod classifier;
pub mod decode;
pub mod engine;
pub mod error;
pub mod executor;
pub mod network;
pub mod normalize;
pub mod registry;
pub mod result;
#[cfg(feature = "torch")]
pub mod torch;

pub use classifier::Classifier;
pub use decode::{DecodeLimits, PixelBuffer, decode_jpeg};
pub use engine::{LoadedModel, Predict, predict};
pub use error::{DecodeError, InferenceError, ModelLoadError, PipelineError};
pub use executor::{DEFAULT_TIMEOUT, run_bounded};
pub use normalize::{InputTensor, Normalizer};
pub use registry::{ArtifactLoader, ModelLoader, ModelRegistry};
pub use result::decode_result;
