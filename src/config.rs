//! Immutable per-run configuration.
//!
//! Unrecognized fields are rejected at parse time rather than silently
//! ignored.

use crate::error::OtaError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stable,
    Developer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    Hard,
    Soft,
    None,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_chunk() -> usize {
    1024
}
fn default_http_retries() -> u32 {
    5
}
fn default_backoff_sec() -> u64 {
    3
}
fn default_max_backoff_sec() -> u64 {
    60
}
fn default_connect_timeout_sec() -> u64 {
    10
}
fn default_http_timeout_sec() -> u64 {
    10
}
fn default_min_free_mem() -> u64 {
    16 * 1024
}
fn default_min_free_storage() -> u64 {
    64 * 1024
}
fn default_max_tree_files() -> usize {
    4096
}
fn default_max_tree_size_kb() -> u64 {
    16 * 1024
}
fn default_stage_dir() -> String {
    ".ota_stage".to_string()
}
fn default_backup_dir() -> String {
    ".ota_backup".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_channel")]
    pub channel: Channel,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default = "default_chunk")]
    pub chunk: usize,
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
    #[serde(default = "default_backoff_sec")]
    pub backoff_sec: u64,
    #[serde(default = "default_max_backoff_sec")]
    pub max_backoff_sec: u64,
    #[serde(default = "default_connect_timeout_sec")]
    pub connect_timeout_sec: u64,
    #[serde(default = "default_http_timeout_sec")]
    pub http_timeout_sec: u64,
    #[serde(default)]
    pub manifest_key: Option<String>,
    #[serde(default = "default_max_tree_files")]
    pub max_tree_files: usize,
    #[serde(default = "default_max_tree_size_kb")]
    pub max_tree_size_kb: u64,
    #[serde(default = "default_min_free_mem")]
    pub min_free_mem: u64,
    #[serde(default = "default_min_free_storage")]
    pub min_free_storage: u64,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub delete_patterns: Vec<String>,
    #[serde(default)]
    pub enable_delta_updates: bool,
    #[serde(default = "default_stage_dir")]
    pub stage_dir: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_reset_mode")]
    pub reset_mode: ResetMode,
    /// Opt-in to accepting manifest file entries that declare neither
    /// `sha256` nor `crc32` (Design Note i). Off by default.
    #[serde(default)]
    pub allow_unverified_files: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_channel() -> Channel {
    Channel::Stable
}
fn default_reset_mode() -> ResetMode {
    ResetMode::Hard
}

const PLACEHOLDERS: &[&str] = &["OWNER", "REPO", "", "<owner>", "<repo>"];

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, OtaError> {
        let cfg: Config =
            toml::from_str(s).map_err(|e| OtaError::Config(format!("invalid config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, OtaError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OtaError::io_fault(path.to_path_buf(), e))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), OtaError> {
        if PLACEHOLDERS.contains(&self.owner.as_str()) {
            return Err(OtaError::Config("owner is unset or a placeholder".into()));
        }
        if PLACEHOLDERS.contains(&self.repo.as_str()) {
            return Err(OtaError::Config("repo is unset or a placeholder".into()));
        }
        if self.chunk == 0 {
            return Err(OtaError::Config("chunk must be positive".into()));
        }
        if self.channel == Channel::Stable && self.manifest_key.is_none() {
            tracing::warn!("manifest_key not configured: stable-channel manifests will be trusted unsigned");
        }
        Ok(())
    }

    pub fn user_agent_or_default(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| "ota-engine".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_placeholder_owner() {
        let toml = r#"
            owner = "OWNER"
            repo = "demo"
        "#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, OtaError::Config(_)));
    }

    #[test]
    fn applies_defaults() {
        let toml = r#"
            owner = "acme"
            repo = "widget"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.branch, "main");
        assert_eq!(cfg.chunk, 1024);
        assert_eq!(cfg.stage_dir, ".ota_stage");
        assert!(matches!(cfg.channel, Channel::Stable));
    }

    #[test]
    fn rejects_unrecognized_option() {
        let toml = r#"
            owner = "acme"
            repo = "widget"
            definitely_not_a_real_option = true
        "#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, OtaError::Config(_)));
    }
}
