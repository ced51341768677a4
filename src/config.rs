//! Pipeline configuration loaded from JSON.

use std::borrow::Cow;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, ConfigResult};
use crate::kernels::KernelCatalog;
use crate::network::LAUNCHES_PER_PASS;

/// Default number of timestamped launches between two waits.
pub const DEFAULT_PROFILING_CAPACITY: usize = 64;

/// Lower bound so that a whole forward pass fits between two waits.
pub const MIN_PROFILING_CAPACITY: usize = LAUNCHES_PER_PASS;

/// Upper bound imposed by the two timestamp queries each launch needs.
pub const MAX_PROFILING_CAPACITY: usize = 2048;

/// Which compute device runs the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// GPU through wgpu.
    #[default]
    Wgpu,
    /// Host reference device.
    Host,
}

/// Adapter selection hint for the GPU backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPreference {
    LowPower,
    #[default]
    HighPerformance,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(preference: PowerPreference) -> Self {
        match preference {
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        }
    }
}

fn default_profiling_capacity() -> usize {
    DEFAULT_PROFILING_CAPACITY
}

/// Settings for building an inference pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub power_preference: PowerPreference,
    /// Launches that may be timestamped before a wait must drain them.
    #[serde(default = "default_profiling_capacity")]
    pub profiling_capacity: usize,
    /// Kernel program to compile instead of the bundled one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_source: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            power_preference: PowerPreference::default(),
            profiling_capacity: DEFAULT_PROFILING_CAPACITY,
            kernel_source: None,
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration file, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config: Self = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "Config file '{}' not found, using default configuration",
                    path.display()
                );
                Self::default()
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(MIN_PROFILING_CAPACITY..=MAX_PROFILING_CAPACITY).contains(&self.profiling_capacity) {
            return Err(ConfigError::Validation {
                field: "profiling_capacity".to_string(),
                message: format!(
                    "must be between {MIN_PROFILING_CAPACITY} and {MAX_PROFILING_CAPACITY}"
                ),
            });
        }
        Ok(())
    }

    /// Builds the kernel catalog, reading the override source when one is configured.
    pub fn kernel_catalog(&self) -> ConfigResult<KernelCatalog> {
        let Some(path) = &self.kernel_source else {
            return Ok(KernelCatalog::bundled());
        };

        let source = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        if source.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "kernel_source".to_string(),
                message: format!("kernel source '{}' is empty", path.display()),
            });
        }
        Ok(KernelCatalog::from_source(source))
    }

    /// Human-readable origin of the kernel program.
    pub fn kernel_source_name(&self) -> Cow<'_, str> {
        match &self.kernel_source {
            Some(path) => path.to_string_lossy(),
            None => Cow::Borrowed("bundled dense.wgsl"),
        }
    }
}
