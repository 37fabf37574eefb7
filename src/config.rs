//! Engine Configuration
//!
//! JSON file, every field optional. A missing file means defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::hashing::CREDENTIAL_ITERATIONS;
use crate::ownership::OwnershipPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Invalid config {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
    #[serde(default = "default_max_decode_bytes")]
    pub max_decode_bytes: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_credential_iterations")]
    pub credential_iterations: u32,
    #[serde(default)]
    pub ownership_policy: OwnershipPolicy,
    #[serde(default)]
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

fn default_storage_root() -> PathBuf { PathBuf::from("uploads") }
fn default_max_image_dimension() -> u32 { 16_384 }
fn default_max_decode_bytes() -> u64 { 512 * 1024 * 1024 }
fn default_max_concurrent_jobs() -> usize { 4 }
fn default_credential_iterations() -> u32 { CREDENTIAL_ITERATIONS }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            max_image_dimension: default_max_image_dimension(),
            max_decode_bytes: default_max_decode_bytes(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            credential_iterations: default_credential_iterations(),
            ownership_policy: OwnershipPolicy::default(),
            bootstrap_admin: None,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid("maxConcurrentJobs must be at least 1".into()));
        }
        if self.max_image_dimension == 0 {
            return Err(ConfigError::Invalid("maxImageDimension must be at least 1".into()));
        }
        if self.credential_iterations == 0 {
            return Err(ConfigError::Invalid("credentialIterations must be at least 1".into()));
        }
        Ok(())
    }
}
