//! Update engine: the top-level state machine that drives a single
//! update attempt from resolution through staging, swap, and (on
//! success) a device reset: connect, resolve target, decide
//! tree-vs-manifest mode, stage, swap, reset.

use crate::capabilities::Capabilities;
use crate::config::{Channel, Config, ResetMode};
use crate::error::OtaError;
use crate::fetcher::Fetcher;
use crate::manifest::Manifest;
use crate::path_guard;
use crate::resolver::{self, TargetDescriptor};
use crate::staging::{self, Candidate, CandidateVerify, StagingCoordinator};
use crate::storage::StorageProbe;
use crate::swap::SwapOrchestrator;
use crate::transport::{self, AlwaysOnTransport, Transport};
use crate::version_record::VersionRecord;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Updated,
    NoChange,
    AbortedResource,
    AbortedValidation,
    RolledBack,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Updated | Outcome::NoChange => 0,
            Outcome::AbortedResource => 2,
            Outcome::AbortedValidation => 3,
            Outcome::RolledBack => 4,
        }
    }

    pub fn reason_line(&self) -> &'static str {
        match self {
            Outcome::Updated => "updated",
            Outcome::NoChange => "no-change",
            Outcome::AbortedResource => "aborted-resource",
            Outcome::AbortedValidation => "aborted-validation",
            Outcome::RolledBack => "rolled-back",
        }
    }
}

pub struct UpdateEngine<'a> {
    cfg: Config,
    caps: &'a dyn Capabilities,
    transport: &'a dyn Transport,
    root: PathBuf,
}

impl<'a> UpdateEngine<'a> {
    /// Builds an engine with the default always-on transport (full
    /// bandwidth, zero cost) — delta is only gated on `Config`'s own
    /// `enable_delta_updates` flag in that case, since the default
    /// transport never itself prefers delta.
    pub fn new(cfg: Config, caps: &'a dyn Capabilities, root: impl Into<PathBuf>) -> Self {
        Self {
            cfg,
            caps,
            transport: &AlwaysOnTransport,
            root: root.into(),
        }
    }

    /// Builds an engine wired to a connectivity collaborator, whose
    /// reported bandwidth/cost additionally gate whether delta is
    /// preferred for this attempt.
    pub fn with_transport(
        cfg: Config,
        caps: &'a dyn Capabilities,
        transport: &'a dyn Transport,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cfg,
            caps,
            transport,
            root: root.into(),
        }
    }

    /// Delta is attempted only when the configuration has opted in AND
    /// the active transport's bandwidth/cost makes it worthwhile.
    fn delta_preferred(&self) -> bool {
        self.cfg.enable_delta_updates && transport::should_prefer_delta(self.transport)
    }

    pub fn run(&self) -> Result<Outcome, OtaError> {
        let storage = StorageProbe::new(self.caps);

        // Resource gate.
        if let Some(free) = storage.free_mem() {
            if free < self.cfg.min_free_mem {
                tracing::warn!(free, min = self.cfg.min_free_mem, "aborting: free memory below minimum");
                return Ok(Outcome::AbortedResource);
            }
        }

        let fetcher = Fetcher::new(&self.cfg, self.caps)?;
        let target = resolver::resolve_target(&self.cfg, &fetcher)?;

        // Identity gate: already at the resolved target and not forced.
        let current = read_current_record(&self.root);
        let at_target = current.as_ref().map(|c| c.commit == target.commit).unwrap_or(false);
        if at_target && !self.cfg.force {
            tracing::info!(commit = %target.commit, "already at target, no update needed");
            return Ok(Outcome::NoChange);
        }

        let (candidates, deletes) = match self.gather_candidates(&fetcher, &target) {
            Ok(c) => c,
            Err(e) if matches!(e, OtaError::Integrity(_) | OtaError::Path(_, _)) => {
                tracing::warn!(error = %e, "validation failed while gathering candidates");
                return Ok(Outcome::AbortedValidation);
            }
            Err(e) => return Err(e),
        };

        // Pre-flight path gate: every candidate path must be well-formed
        // before any network bytes are spent fetching it.
        for candidate in &candidates {
            if path_guard::normalize(&candidate.rel_path).is_err() {
                tracing::warn!(path = %candidate.rel_path, "aborting: candidate path failed path guard");
                return Ok(Outcome::AbortedValidation);
            }
        }

        // Pre-flight storage gate: free space must be at least twice the
        // total declared size of what we're about to fetch, leaving
        // headroom for the backup copies the swap will create.
        let total_size: u64 = candidates
            .iter()
            .map(|c| match &c.verify {
                CandidateVerify::GitBlob { size, .. } => *size,
                CandidateVerify::Stable { size, .. } => size.unwrap_or(0),
            })
            .sum();
        if let Some(free) = storage.free_storage(&self.root) {
            if free < total_size.saturating_mul(2) {
                tracing::warn!(free, required = total_size * 2, "aborting: insufficient free storage");
                return Ok(Outcome::AbortedResource);
            }
        }

        let coordinator = StagingCoordinator::new(&self.cfg, &fetcher, self.caps, &self.root);
        if let Err(e) = coordinator.stage_all(&candidates) {
            tracing::warn!(error = %e, "staging failed before any swap began");
            return if e.is_swap_fatal() {
                Ok(Outcome::AbortedValidation)
            } else {
                Err(e)
            };
        }

        let orchestrator = SwapOrchestrator::new(&self.root, &self.cfg.stage_dir, &self.cfg.backup_dir)?;
        let record = VersionRecord::new(target.ref_.clone(), target.commit.clone());
        match orchestrator.run_swap(&deletes, &self.cfg.delete_patterns, &record) {
            Ok(outcome) => {
                tracing::info!(applied = outcome.applied, deleted = outcome.deleted, "swap committed");
            }
            Err(e) => {
                tracing::error!(error = %e, "swap failed, rolled back");
                return Ok(Outcome::RolledBack);
            }
        }

        self.perform_reset();
        Ok(Outcome::Updated)
    }

    fn perform_reset(&self) {
        match self.cfg.reset_mode {
            ResetMode::Hard | ResetMode::Soft => {
                self.caps.led_pattern("update-complete");
                tracing::info!(mode = ?self.cfg.reset_mode, "update applied, reset requested");
            }
            ResetMode::None => {
                tracing::info!("update applied, reset suppressed by configuration");
            }
        }
    }

    /// Builds the candidate list and delete list for this target,
    /// branching on channel: developer mode walks the git tree, stable
    /// mode prefers a signed manifest when the release carries one.
    fn gather_candidates(
        &self,
        fetcher: &Fetcher,
        target: &TargetDescriptor,
    ) -> Result<(Vec<Candidate>, Vec<String>), OtaError> {
        match self.cfg.channel {
            Channel::Developer => self.gather_tree_candidates(fetcher, target),
            Channel::Stable => self.gather_manifest_candidates(fetcher, target),
        }
    }

    fn gather_tree_candidates(
        &self,
        fetcher: &Fetcher,
        target: &TargetDescriptor,
    ) -> Result<(Vec<Candidate>, Vec<String>), OtaError> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/git/trees/{}?recursive=1",
            self.cfg.owner, self.cfg.repo, target.commit
        );
        let tree = fetcher.get_json(&url)?;
        let entries = tree
            .get("tree")
            .and_then(|v| v.as_array())
            .ok_or_else(|| OtaError::Network("tree response missing 'tree' array".into()))?;

        staging::enforce_tree_limits(&self.cfg, entries.len(), None)?;

        let mut candidates = Vec::new();
        for entry in entries {
            if entry.get("type").and_then(|v| v.as_str()) != Some("blob") {
                continue;
            }
            let path = match entry.get("path").and_then(|v| v.as_str()) {
                Some(p) => p.to_string(),
                None => continue,
            };
            // A path that fails normalization (traversal, absolute, empty
            // segment) is not a candidate we can simply drop: the whole
            // update must abort rather than silently install everything
            // else around it.
            path_guard::normalize(&path)?;
            if !path_guard::is_permitted(&path, &self.cfg.allow, &self.cfg.ignore) {
                continue;
            }
            let sha = entry
                .get("sha")
                .and_then(|v| v.as_str())
                .ok_or_else(|| OtaError::Integrity(format!("tree entry '{path}' missing sha")))?
                .to_string();
            let size = entry
                .get("size")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| OtaError::Integrity(format!("tree entry '{path}' missing size")))?;
            let url = raw_url(&self.cfg, &target.commit, &path);
            let delta_url = if self.delta_preferred() {
                Some(delta_url(&self.cfg, &target.commit, &path))
            } else {
                None
            };
            candidates.push(Candidate {
                rel_path: path,
                url,
                delta_url,
                verify: CandidateVerify::GitBlob { sha, size },
            });
        }
        Ok((candidates, Vec::new()))
    }

    fn gather_manifest_candidates(
        &self,
        fetcher: &Fetcher,
        target: &TargetDescriptor,
    ) -> Result<(Vec<Candidate>, Vec<String>), OtaError> {
        let release = target
            .release_info
            .as_ref()
            .ok_or_else(|| OtaError::State("stable target missing release metadata".into()))?;
        let asset = resolver::find_manifest_asset(release)
            .ok_or_else(|| OtaError::State("release has no manifest.json asset".into()))?;
        let download_url = asset
            .get("browser_download_url")
            .or_else(|| asset.get("url"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OtaError::Network("manifest asset missing download url".into()))?;

        let mut resp = fetcher.get(download_url, true)?;
        let mut body = String::new();
        std::io::Read::read_to_string(&mut resp, &mut body)
            .map_err(|e| OtaError::Network(format!("failed to read manifest: {e}")))?;
        let manifest = Manifest::from_json_str(&body)?;
        crate::manifest::verify_signature(&manifest, self.cfg.manifest_key.as_deref())?;
        manifest.check_verifiable(self.cfg.allow_unverified_files)?;
        if self.cfg.allow_unverified_files {
            tracing::warn!("allow_unverified_files is set: accepting manifest entries without sha256/crc32");
        }

        let mut candidates = Vec::new();
        for file in &manifest.files {
            // As above: a malformed path aborts the whole update instead of
            // being quietly filtered out (§8 scenario 5).
            path_guard::normalize(&file.path)?;
            if !path_guard::is_permitted(&file.path, &self.cfg.allow, &self.cfg.ignore) {
                continue;
            }
            let url = raw_url(&self.cfg, &target.ref_, &file.path);
            let delta_url = if self.delta_preferred() {
                Some(delta_url(&self.cfg, &target.ref_, &file.path))
            } else {
                None
            };
            candidates.push(Candidate {
                rel_path: file.path.clone(),
                url,
                delta_url,
                verify: CandidateVerify::Stable {
                    sha256: file.sha256.clone(),
                    crc32: file.crc32,
                    size: file.size,
                },
            });
        }
        Ok((candidates, manifest.deletes.clone()))
    }
}

fn raw_url(cfg: &Config, ref_or_commit: &str, path: &str) -> String {
    format!(
        "https://raw.githubusercontent.com/{}/{}/{}/{}",
        cfg.owner, cfg.repo, ref_or_commit, path
    )
}

/// The delta artifact's fixed location (§6): `.deltas/{path with slashes
/// replaced by underscores}.delta`, at the target ref — not a `.delta`
/// sibling of the raw artifact URL.
fn delta_url(cfg: &Config, ref_or_commit: &str, path: &str) -> String {
    let flattened = path.replace('/', "_");
    raw_url(cfg, ref_or_commit, &format!(".deltas/{flattened}.delta"))
}

/// Reads the installed-version record, recovering a `StateError` (corrupt
/// `version.json`) by treating the installed state as absent rather than
/// failing the run.
fn read_current_record(root: &std::path::Path) -> Option<VersionRecord> {
    match VersionRecord::read(root) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(error = %e, "version record unreadable, treating as no prior version");
            None
        }
    }
}
