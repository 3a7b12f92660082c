use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::decode::{DEFAULT_MAX_IMAGE_BYTES, DecodeLimits};
use crate::pipeline::executor::DEFAULT_TIMEOUT;
use crate::pipeline::normalize::{CHANNELS, DEFAULT_INPUT_SIZE, DEFAULT_SCALE, Normalizer};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse pipeline config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported pipeline config: {0}")]
    Unsupported(String),
}

/// Preprocessing settings, read from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: f32,
    pub image: ImageConfig,
    pub normalization: NormalizationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub size: u32,
    pub channels: u32,
    pub preprocessing: PreprocessingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    pub resize_method: String,
    #[serde(default)]
    pub half_pixel_centers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationConfig {
    pub scale: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1.0,
            image: ImageConfig {
                size: DEFAULT_INPUT_SIZE as u32,
                channels: CHANNELS as u32,
                preprocessing: PreprocessingConfig {
                    resize_method: "bilinear".to_string(),
                    half_pixel_centers: false,
                },
            },
            normalization: NormalizationConfig {
                scale: DEFAULT_SCALE,
            },
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.preprocessing.resize_method != "bilinear" {
            return Err(ConfigError::Unsupported(format!(
                "resize_method `{}` (only bilinear)",
                self.image.preprocessing.resize_method
            )));
        }
        if self.image.channels != CHANNELS as u32 {
            return Err(ConfigError::Unsupported(format!(
                "{} channels (only RGB)",
                self.image.channels
            )));
        }
        if self.image.size == 0 {
            return Err(ConfigError::Unsupported("image size 0".into()));
        }
        if !(self.normalization.scale.is_finite() && self.normalization.scale > 0.0) {
            return Err(ConfigError::Unsupported(format!(
                "normalization scale {}",
                self.normalization.scale
            )));
        }
        let size = self.image.size as usize;
        if size != DEFAULT_INPUT_SIZE || self.normalization.scale != DEFAULT_SCALE {
            log::warn!(
                "Preprocessing differs from the {}px / {} defaults used in training",
                DEFAULT_INPUT_SIZE,
                DEFAULT_SCALE
            );
        }
        Ok(())
    }

    pub fn to_normalizer(&self) -> Normalizer {
        Normalizer {
            size: self.image.size as usize,
            scale: self.normalization.scale,
            half_pixel_centers: self.image.preprocessing.half_pixel_centers,
        }
    }
}

/// Service settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub model_dir: PathBuf,
    pub inference_timeout: Duration,
    pub history_url: Option<String>,
    pub preload_models: bool,
    pub max_image_bytes: usize,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let pipeline = match lookup("PIPELINE_CONFIG") {
            Some(path) => PipelineConfig::load(Path::new(&path))?,
            None => PipelineConfig::default(),
        };

        Ok(Self {
            port: parse_or(&lookup, "PORT", 8081)?,
            model_dir: lookup("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("models")),
            inference_timeout: Duration::from_millis(parse_or(
                &lookup,
                "INFERENCE_TIMEOUT_MS",
                DEFAULT_TIMEOUT.as_millis() as u64,
            )?),
            history_url: lookup("HISTORY_URL").filter(|url| !url.trim().is_empty()),
            preload_models: parse_or(&lookup, "PRELOAD_MODELS", true)?,
            max_image_bytes: parse_or(&lookup, "MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES)?,
            pipeline,
        })
    }

    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_image_bytes: self.max_image_bytes,
            ..DecodeLimits::default()
        }
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}
