// src/config.rs

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

pub const CONFIG_ENV: &str = "ADAS_PILOT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file falls back to defaults.
    /// A file that exists and does not parse is still an error.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            warn!("Config {} not found, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Config path from `ADAS_PILOT_CONFIG`, else `config.yaml`.
    pub fn path_from_env() -> String {
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }

    pub fn with_source_override(mut self, source: Option<String>) -> Self {
        if let Some(source) = source {
            self.video.source = source;
        }
        self
    }
}
