//! Transform configuration
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! warn_dropped_futures = false
//! continuation_suffix = "$resume"
//! ```

use rewind_bytecode::names;
use rewind_bytecode::Type;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for these options
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Options controlling the transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformOptions {
    /// Owner of the await primitive
    pub await_owner: String,
    /// Name of the await primitive
    pub await_name: String,
    /// Canonical future type
    pub future_type: String,
    /// Surface marker type replaced by `future_type`
    pub awaitable_type: String,
    /// Owner of the future library
    pub futures_owner: String,
    /// Surface helpers retargeted to the future library
    pub composition_helpers: Vec<String>,
    /// Warn when a future value is discarded
    pub warn_dropped_futures: bool,
    /// Re-analyze the emitted methods
    pub verify_output: bool,
    /// Appended to a method name to name its continuation
    pub continuation_suffix: String,
    /// Maximum instruction visits during frame analysis
    pub visit_budget: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            await_owner: names::ASYNC_CLASS.to_string(),
            await_name: names::AWAIT_METHOD.to_string(),
            future_type: names::FUTURE_CLASS.to_string(),
            awaitable_type: names::AWAITABLE_CLASS.to_string(),
            futures_owner: names::FUTURES_CLASS.to_string(),
            composition_helpers: vec![
                names::ALL_METHOD.to_string(),
                names::MAP_METHOD.to_string(),
            ],
            warn_dropped_futures: true,
            verify_output: true,
            continuation_suffix: "$async".to_string(),
            visit_budget: 200_000,
        }
    }
}

impl TransformOptions {
    /// Parse options from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load options from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// The future type as a `Type`
    pub fn future(&self) -> Type {
        Type::object(self.future_type.clone())
    }

    /// Whether `ty` is the future or the marker type
    pub fn is_future_like(&self, ty: &Type) -> bool {
        ty.is_class(&self.future_type) || ty.is_class(&self.awaitable_type)
    }

    /// Whether `ty` is the marker type
    pub fn is_marker(&self, ty: &Type) -> bool {
        ty.is_class(&self.awaitable_type)
    }

    /// `ty` with the marker type replaced by the future type
    pub fn map_type(&self, ty: &Type) -> Type {
        if self.is_marker(ty) {
            self.future()
        } else {
            ty.clone()
        }
    }
}
