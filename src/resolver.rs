//! Target resolver: maps a channel to a target descriptor by talking to
//! the repository host's release/ref/tag endpoints.

use crate::config::{Channel, Config};
use crate::error::OtaError;
use crate::fetcher::Fetcher;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    Tag,
    Branch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub ref_: String,
    pub commit: String,
    pub mode: TargetMode,
    pub release_info: Option<serde_json::Value>,
}

fn api_base(owner: &str, repo: &str) -> String {
    format!("https://api.github.com/repos/{owner}/{repo}")
}

pub fn resolve_target(cfg: &Config, fetcher: &Fetcher) -> Result<TargetDescriptor, OtaError> {
    match cfg.channel {
        Channel::Stable => resolve_stable(cfg, fetcher),
        Channel::Developer => resolve_developer(cfg, fetcher),
    }
}

fn resolve_ref(cfg: &Config, fetcher: &Fetcher, ref_path: &str) -> Result<String, OtaError> {
    let url = format!("{}/git/ref/{ref_path}", api_base(&cfg.owner, &cfg.repo));
    let json = fetcher.get_json(&url)?;
    let obj = json
        .get("object")
        .ok_or_else(|| OtaError::Network(format!("missing 'object' in ref response for {ref_path}")))?;
    let obj_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let sha = obj
        .get("sha")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OtaError::Network("missing 'sha' in ref object".into()))?;
    if obj_type == "commit" {
        return Ok(sha.to_string());
    }
    // Annotated tag object: dereference once to the commit it points at.
    let tag_url = format!("{}/git/tags/{sha}", api_base(&cfg.owner, &cfg.repo));
    let tag_json = fetcher.get_json(&tag_url)?;
    tag_json
        .pointer("/object/sha")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| OtaError::Network("missing commit sha in annotated tag".into()))
}

fn resolve_stable(cfg: &Config, fetcher: &Fetcher) -> Result<TargetDescriptor, OtaError> {
    let url = format!("{}/releases/latest", api_base(&cfg.owner, &cfg.repo));
    let release = fetcher.get_json(&url)?;
    let tag = release
        .get("tag_name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OtaError::Network("release missing tag_name".into()))?
        .to_string();
    let commit = resolve_ref(cfg, fetcher, &format!("tags/{tag}"))?;
    Ok(TargetDescriptor {
        ref_: tag,
        commit,
        mode: TargetMode::Tag,
        release_info: Some(release),
    })
}

fn resolve_developer(cfg: &Config, fetcher: &Fetcher) -> Result<TargetDescriptor, OtaError> {
    let url = format!("{}/git/ref/heads/{}", api_base(&cfg.owner, &cfg.repo), cfg.branch);
    let json = fetcher.get_json(&url)?;
    let obj = json
        .get("object")
        .ok_or_else(|| OtaError::Network("missing 'object' in branch ref response".into()))?;
    let mut sha = obj
        .get("sha")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OtaError::Network("missing 'sha' in branch ref object".into()))?
        .to_string();
    if obj.get("type").and_then(|v| v.as_str()) == Some("tag") {
        let tag_url = format!("{}/git/tags/{sha}", api_base(&cfg.owner, &cfg.repo));
        let tag_json = fetcher.get_json(&tag_url)?;
        sha = tag_json
            .pointer("/object/sha")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| OtaError::Network("missing commit sha in annotated tag".into()))?;
    }
    Ok(TargetDescriptor {
        ref_: cfg.branch.clone(),
        commit: sha,
        mode: TargetMode::Branch,
        release_info: None,
    })
}

/// Scans a release's `assets` array for a `manifest.json` asset, the
/// engine's preference when present.
pub fn find_manifest_asset(release: &serde_json::Value) -> Option<&serde_json::Value> {
    release
        .get("assets")?
        .as_array()?
        .iter()
        .find(|a| a.get("name").and_then(|n| n.as_str()) == Some("manifest.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_manifest_asset_by_name() {
        let release = json!({
            "assets": [
                {"name": "app.tar.gz", "url": "https://example/app"},
                {"name": "manifest.json", "url": "https://example/manifest"},
            ]
        });
        let asset = find_manifest_asset(&release).unwrap();
        assert_eq!(asset["url"], "https://example/manifest");
    }

    #[test]
    fn no_manifest_asset_returns_none() {
        let release = json!({"assets": [{"name": "app.tar.gz"}]});
        assert!(find_manifest_asset(&release).is_none());
    }
}
