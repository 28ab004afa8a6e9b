//! Configuration for toolscope.
//!
//! Configuration can be set via environment variables:
//! - `TOOLSCOPE_INPUT` - Optional. Path of an SSE capture to replay. Unset
//!   means the replay binary reads stdin.
//! - `TOOLSCOPE_IMAGE_FORMAT` - Optional. Image format assumed for
//!   progressive frames when the provider never names one. Defaults to `png`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Engine and replay-binary configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SSE capture to replay; `None` reads stdin (replay binary only).
    pub input: Option<PathBuf>,

    /// Image format assumed when the provider never reports one.
    pub default_image_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: None,
            default_image_format: "png".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let input = std::env::var("TOOLSCOPE_INPUT").ok().map(PathBuf::from);

        let default_image_format = match std::env::var("TOOLSCOPE_IMAGE_FORMAT") {
            Ok(format) => {
                let format = format.trim().to_lowercase();
                if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(ConfigError::InvalidValue(
                        "TOOLSCOPE_IMAGE_FORMAT".to_string(),
                        format,
                    ));
                }
                format
            }
            Err(_) => "png".to_string(),
        };

        Ok(Self {
            input,
            default_image_format,
        })
    }
}
