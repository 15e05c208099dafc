//! Config Surface
//!
//! Loads the daemon's TOML config file, applies environment overrides the
//! way `conductor::ConductorConfig::from_env` does, and validates a
//! proposed delta before any subsystem is touched. Ported in spirit from
//! the original daemon's trivial `ConfigManager`
//! (`examples/original_source/daemon/src/config.h`), which only round-
//! tripped a `QJsonObject`; the richer validation and atomic-apply
//! semantics here are this crate's own, since the original left config
//! plumbing entirely to the UI layer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::gpu_guard::GpuGuardConfig;
use crate::inference_client::InferenceEndpoint;
use crate::task_queue::{ClassLimits, QueueConfig};

/// The full daemon configuration, as persisted in
/// `$XDG_CONFIG_HOME/vibenote/daemon.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VibenoteConfig {
    pub queue: QueueSection,
    pub gpu: GpuSection,
    pub inference: InferenceSection,
}

impl Default for VibenoteConfig {
    fn default() -> Self {
        Self {
            queue: QueueSection::default(),
            gpu: GpuSection::default(),
            inference: InferenceSection::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub capacity: usize,
    pub watch_limit: usize,
    pub interactive_limit: usize,
    pub export_limit: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            capacity: defaults.capacity,
            watch_limit: defaults.class_limits.watch,
            interactive_limit: defaults.class_limits.interactive,
            export_limit: defaults.class_limits.export,
        }
    }
}

impl QueueSection {
    #[must_use]
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.capacity,
            class_limits: ClassLimits {
                watch: self.watch_limit,
                interactive: self.interactive_limit,
                export: self.export_limit,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSection {
    pub util_high_threshold: f32,
    pub util_resume_margin: f32,
    pub vram_headroom_mb: u64,
    pub assumed_model_layers: u32,
    pub device_index: u32,
}

impl Default for GpuSection {
    fn default() -> Self {
        let defaults = GpuGuardConfig::default();
        Self {
            util_high_threshold: defaults.util_high_threshold,
            util_resume_margin: defaults.util_resume_margin,
            vram_headroom_mb: defaults.vram_headroom_mb,
            assumed_model_layers: defaults.assumed_model_layers,
            device_index: 0,
        }
    }
}

impl GpuSection {
    #[must_use]
    pub fn to_guard_config(&self) -> GpuGuardConfig {
        GpuGuardConfig {
            util_high_threshold: self.util_high_threshold,
            util_resume_margin: self.util_resume_margin,
            vram_headroom_mb: self.vram_headroom_mb,
            assumed_model_layers: self.assumed_model_layers,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSection {
    pub host: String,
    pub port: u16,
    pub server_binary: Option<String>,
    pub model_path: Option<String>,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8091,
            server_binary: None,
            model_path: None,
        }
    }
}

impl InferenceSection {
    #[must_use]
    pub fn to_endpoint(&self) -> InferenceEndpoint {
        InferenceEndpoint {
            host: self.host.clone(),
            port: self.port,
            server_binary: self.server_binary.clone(),
            model_path: self.model_path.clone(),
        }
    }
}

impl VibenoteConfig {
    /// Load from `path`, falling back to defaults if the file does not
    /// exist. A malformed file is an error; a missing one is not. Uses
    /// `tokio::fs` rather than `std::fs` so config loading never blocks
    /// the async runtime's worker threads.
    pub async fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| ConfigLoadError::Parse(path.to_path_buf(), e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigLoadError::Io(path.to_path_buf(), e.to_string())),
        }
    }

    /// Default config file path: `$XDG_CONFIG_HOME/vibenote/daemon.toml`,
    /// falling back to `~/.config/vibenote/daemon.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vibenote")
            .join("daemon.toml")
    }

    /// Apply environment variable overrides, mirroring the
    /// `VIBENOTE_*`-prefixed pattern the daemon's other env-driven
    /// settings use.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("VIBENOTE_QUEUE_CAPACITY") {
            if let Ok(parsed) = v.parse() {
                self.queue.capacity = parsed;
            }
        }
        if let Ok(v) = std::env::var("VIBENOTE_INFERENCE_HOST") {
            self.inference.host = v;
        }
        if let Ok(v) = std::env::var("VIBENOTE_INFERENCE_PORT") {
            if let Ok(parsed) = v.parse() {
                self.inference.port = parsed;
            }
        }
        self
    }

    /// Validate every section. Returns all failing field descriptions at
    /// once rather than stopping at the first, so `PUT /v1/config` can
    /// report the complete set of problems in one response.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(mut e) = self.queue.to_queue_config().validate() {
            errors.append(&mut e);
        }
        if let Err(mut e) = self.gpu.to_guard_config().validate(None) {
            errors.append(&mut e);
        }
        if let Err(mut e) = self.inference.to_endpoint().validate() {
            errors.append(&mut e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Errors loading the config file from disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {0:?}: {1}")]
    Io(PathBuf, String),
    #[error("failed to parse config file {0:?}: {1}")]
    Parse(PathBuf, String),
}
