//! Controller configuration
//!
//! Loaded from a YAML file mounted into the controller pod. Every section has
//! a usable default so the controller can come up without a ConfigMap during
//! local development.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Default init/worker images used when an Agent does not pin its own
    #[serde(default)]
    pub images: ImagesConfig,

    /// Execution pod settings
    #[serde(default)]
    pub pod: PodConfig,

    /// Admission backoff settings
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Deferred context fetch settings (realized by the init container)
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Worker output capture settings
    #[serde(default)]
    pub output: OutputConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Image configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    /// Image repository (e.g. "ghcr.io/agents-platform/toolchain")
    pub repository: String,

    /// Image tag (e.g. "latest", "v0.3.1")
    pub tag: String,
}

impl ImageConfig {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImagesConfig {
    /// Default init-container image (toolchain staging, context fetches)
    #[serde(default = "default_init_image")]
    pub init: ImageConfig,

    /// Default worker-container image
    #[serde(default = "default_worker_image")]
    pub worker: ImageConfig,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            init: default_init_image(),
            worker: default_worker_image(),
        }
    }
}

fn default_init_image() -> ImageConfig {
    ImageConfig {
        repository: "ghcr.io/agents-platform/toolchain".to_string(),
        tag: "latest".to_string(),
    }
}

fn default_worker_image() -> ImageConfig {
    ImageConfig {
        repository: "ghcr.io/agents-platform/executor".to_string(),
        tag: "latest".to_string(),
    }
}

/// Execution pod settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PodConfig {
    /// Pod timeout in seconds
    #[serde(default = "default_active_deadline", rename = "activeDeadlineSeconds")]
    pub active_deadline_seconds: i64,

    /// Directory inside the init image whose content is staged onto the
    /// shared workspace volume
    #[serde(default = "default_toolchain_dir", rename = "toolchainDir")]
    pub toolchain_dir: String,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            active_deadline_seconds: default_active_deadline(),
            toolchain_dir: default_toolchain_dir(),
        }
    }
}

fn default_active_deadline() -> i64 {
    3600
}

fn default_toolchain_dir() -> String {
    "/opt/agent".to_string()
}

/// Bounded exponential backoff for admission deferrals
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    /// First retry delay in seconds
    #[serde(default = "default_backoff_base", rename = "backoffBaseSeconds")]
    pub backoff_base_seconds: u64,

    /// Ceiling on the retry delay in seconds
    #[serde(default = "default_backoff_cap", rename = "backoffCapSeconds")]
    pub backoff_cap_seconds: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            backoff_base_seconds: default_backoff_base(),
            backoff_cap_seconds: default_backoff_cap(),
        }
    }
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_cap() -> u64 {
    300
}

/// Retry policy for init-container URL fetches
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    /// Attempts before the fetch (and therefore the Task) is declared failed
    #[serde(default = "default_fetch_attempts")]
    pub attempts: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_fetch_backoff", rename = "backoffSeconds")]
    pub backoff_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempts: default_fetch_attempts(),
            backoff_seconds: default_fetch_backoff(),
        }
    }
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_backoff() -> u64 {
    5
}

/// Worker output capture settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Log lines requested from the worker container
    #[serde(default = "default_tail_lines", rename = "tailLines")]
    pub tail_lines: i64,

    /// Byte cap on `status.output`; exceeding it flags truncation
    #[serde(default = "default_max_bytes", rename = "maxBytes")]
    pub max_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_tail_lines() -> i64 {
    50
}

fn default_max_bytes() -> usize {
    16 * 1024
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

impl ControllerConfig {
    /// Load configuration from a mounted file
    pub fn from_mounted_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `CONTROLLER_CONFIG_PATH` (or the default mount point),
    /// falling back to defaults when the file is missing or malformed.
    pub fn load() -> Self {
        let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
        let config_path = override_path
            .as_deref()
            .filter(|path| std::path::Path::new(path).exists())
            .unwrap_or("/config/config.yaml");

        match Self::from_mounted_file(config_path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(
                    "Failed to load configuration from {}: {}. Using defaults.",
                    config_path, err
                );
                Self::default()
            }
        }
    }

    /// Validate configuration has sane values
    pub fn validate(&self) -> Result<(), String> {
        if self.images.init.repository.trim().is_empty() {
            return Err("images.init.repository must not be empty".to_string());
        }
        if self.images.worker.repository.trim().is_empty() {
            return Err("images.worker.repository must not be empty".to_string());
        }
        if self.pod.active_deadline_seconds <= 0 {
            return Err("pod.activeDeadlineSeconds must be positive".to_string());
        }
        if self.admission.backoff_base_seconds == 0 {
            return Err("admission.backoffBaseSeconds must be positive".to_string());
        }
        if self.admission.backoff_cap_seconds < self.admission.backoff_base_seconds {
            return Err("admission.backoffCapSeconds must be >= backoffBaseSeconds".to_string());
        }
        if self.fetch.attempts == 0 {
            return Err("fetch.attempts must be positive".to_string());
        }
        if self.output.max_bytes == 0 {
            return Err("output.maxBytes must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pod.active_deadline_seconds, 3600);
        assert_eq!(config.admission.backoff_base_seconds, 5);
        assert_eq!(config.output.tail_lines, 50);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r"
images:
  worker:
    repository: ghcr.io/acme/runner
    tag: v2
pod:
  activeDeadlineSeconds: 600
";
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.images.worker.reference(), "ghcr.io/acme/runner:v2");
        assert_eq!(
            config.images.init.repository,
            "ghcr.io/agents-platform/toolchain"
        );
        assert_eq!(config.pod.active_deadline_seconds, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = ControllerConfig::default();
        config.admission.backoff_base_seconds = 60;
        config.admission.backoff_cap_seconds = 10;
        assert!(config.validate().is_err());
    }
}
