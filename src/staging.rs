//! Staging coordinator: for each candidate artifact, skips it if the
//! live tree is already identical, otherwise tries a delta against the
//! live copy, otherwise fetches the full blob, verifying as it streams
//! and placing the verified result under `stage/<path>`.

use crate::atomic_writer::AtomicFileWriter;
use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::delta;
use crate::error::OtaError;
use crate::fetcher::Fetcher;
use crate::hasher;
use crate::path_guard;
use crate::storage::StorageProbe;
use crc32fast::Hasher as Crc32Hasher;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// How a candidate's downloaded bytes are expected to verify.
#[derive(Debug, Clone)]
pub enum CandidateVerify {
    /// Developer-channel tree entry: git blob identity hash, which also
    /// fixes the declared size (the hash is over `"blob " + size + "\0" +
    /// bytes`).
    GitBlob { sha: String, size: u64 },
    /// Stable-channel manifest entry: SHA-256 preferred, CRC-32 as a
    /// fallback when SHA-256 is absent, with an optional declared size.
    Stable {
        sha256: Option<String>,
        crc32: Option<u32>,
        size: Option<u64>,
    },
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub rel_path: String,
    pub url: String,
    pub delta_url: Option<String>,
    pub verify: CandidateVerify,
}

/// Enforces the tree-mode pre-parse limits: the candidate count and,
/// where the transport can report it, the total declared size.
pub fn enforce_tree_limits(cfg: &Config, file_count: usize, total_size_kb: Option<u64>) -> Result<(), OtaError> {
    if file_count > cfg.max_tree_files {
        return Err(OtaError::Resource(format!(
            "tree has {file_count} files, exceeds max_tree_files {}",
            cfg.max_tree_files
        )));
    }
    if let Some(total) = total_size_kb {
        if total > cfg.max_tree_size_kb {
            return Err(OtaError::Resource(format!(
                "tree size {total} KB exceeds max_tree_size_kb {}",
                cfg.max_tree_size_kb
            )));
        }
    }
    Ok(())
}

pub struct StagingCoordinator<'a> {
    root: PathBuf,
    stage_dir: PathBuf,
    allow: Vec<String>,
    ignore: Vec<String>,
    enable_delta_updates: bool,
    chunk: usize,
    fetcher: &'a Fetcher<'a>,
    storage: StorageProbe<'a>,
    caps: &'a dyn Capabilities,
}

impl<'a> StagingCoordinator<'a> {
    pub fn new(cfg: &Config, fetcher: &'a Fetcher<'a>, caps: &'a dyn Capabilities, root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            stage_dir: root.join(&cfg.stage_dir),
            allow: cfg.allow.clone(),
            ignore: cfg.ignore.clone(),
            enable_delta_updates: cfg.enable_delta_updates,
            chunk: cfg.chunk,
            fetcher,
            storage: StorageProbe::new(caps),
            caps,
        }
    }

    /// Stages every candidate, returning the list of relative paths that
    /// ended up under `stage_dir` (candidates skipped by identity are
    /// omitted).
    pub fn stage_all(&self, candidates: &[Candidate]) -> Result<Vec<String>, OtaError> {
        let chunk_size = self.storage.adapt_chunk_size(self.chunk);
        let mut staged = Vec::new();

        for candidate in candidates {
            let rel = path_guard::normalize(&candidate.rel_path)?;
            if !path_guard::is_permitted(&rel, &self.allow, &self.ignore) {
                continue;
            }
            let live_path = path_guard::contains(&self.root, &rel)?;
            let stage_path = path_guard::contains(&self.stage_dir, &rel)?;

            if self.identity_matches(&live_path, &candidate.verify, chunk_size)? {
                continue;
            }

            let mut staged_via_delta = false;
            if self.enable_delta_updates && live_path.exists() {
                if let Some(delta_url) = &candidate.delta_url {
                    let expected_sha256 = match &candidate.verify {
                        CandidateVerify::Stable { sha256: Some(s), .. } => Some(s.as_str()),
                        _ => None,
                    };
                    staged_via_delta =
                        self.try_delta(&live_path, delta_url, &stage_path, expected_sha256, chunk_size)?;
                }
            }

            if !staged_via_delta {
                self.fetch_verify_stage(&candidate.url, &stage_path, &candidate.verify, chunk_size)?;
            }
            staged.push(rel);
        }
        Ok(staged)
    }

    /// Identity-skip: the live file already hashes to the candidate's
    /// target identity, and (Design Note iv) its size matches the
    /// candidate's declared size, so re-fetching would be wasted flash
    /// wear.
    fn identity_matches(&self, live_path: &Path, verify: &CandidateVerify, chunk_size: usize) -> Result<bool, OtaError> {
        if !live_path.exists() {
            return Ok(false);
        }
        let live_size = fs::metadata(live_path)
            .map_err(|e| OtaError::io_fault(live_path.to_path_buf(), e))?
            .len();
        match verify {
            CandidateVerify::GitBlob { sha, size } => {
                if live_size != *size {
                    return Ok(false);
                }
                Ok(&hasher::git_blob_sha1_file(live_path, *size, chunk_size)? == sha)
            }
            CandidateVerify::Stable { sha256, crc32, size } => {
                if let Some(declared) = size {
                    if live_size != *declared {
                        return Ok(false);
                    }
                }
                if let Some(expected) = sha256 {
                    Ok(&hasher::sha256_file(live_path, chunk_size)? == expected)
                } else if let Some(expected) = crc32 {
                    Ok(hasher::crc32_file(live_path, chunk_size)? == *expected)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Attempts a delta apply against the live file. A delta failure is
    /// not fatal to the whole update: it is logged and the caller falls
    /// back to a full blob fetch.
    ///
    /// The delta body is streamed to a temporary file under `stage_dir`
    /// rather than buffered in memory, so the apply goes through
    /// `FileDeltaSource`'s 64-byte lookahead reader — the canonical,
    /// bounded-memory streaming path (§4.5) — instead of materializing
    /// the whole delta.
    fn try_delta(
        &self,
        live_path: &Path,
        delta_url: &str,
        stage_path: &Path,
        expected_sha256: Option<&str>,
        chunk_size: usize,
    ) -> Result<bool, OtaError> {
        // A delta sibling asset that doesn't exist (404, or any other
        // fetch failure) just means no delta is available for this path;
        // that is not fatal, the caller falls back to a full fetch.
        let mut resp = match self.fetcher.get(delta_url, true) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, delta_url, "no delta available, falling back to full fetch");
                return Ok(false);
            }
        };

        let delta_tmp_path = delta_tmp_path(stage_path);
        if let Some(parent) = delta_tmp_path.parent() {
            fs::create_dir_all(parent).map_err(|e| OtaError::io_fault(parent.to_path_buf(), e))?;
        }
        {
            let mut delta_file = fs::File::create(&delta_tmp_path)
                .map_err(|e| OtaError::io_fault(delta_tmp_path.clone(), e))?;
            let mut buf = vec![0u8; chunk_size.max(1)];
            loop {
                let n = resp
                    .read(&mut buf)
                    .map_err(|e| OtaError::Network(format!("failed to download delta: {e}")))?;
                if n == 0 {
                    break;
                }
                std::io::Write::write_all(&mut delta_file, &buf[..n])
                    .map_err(|e| OtaError::io_fault(delta_tmp_path.clone(), e))?;
                self.caps.wdt_feed();
            }
            delta_file
                .sync_all()
                .map_err(|e| OtaError::io_fault(delta_tmp_path.clone(), e))?;
        }

        let result = (|| {
            let mut source = delta::FileDeltaSource::open(&delta_tmp_path).map_err(OtaError::from)?;
            delta::apply_delta(live_path, &mut source, stage_path, expected_sha256, chunk_size)
        })();
        let _ = fs::remove_file(&delta_tmp_path);

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "delta apply failed, falling back to full fetch");
                Ok(false)
            }
        }
    }

    /// Streams the full blob straight into an `AtomicFileWriter` at
    /// `stage_path` while feeding whichever hashers the candidate's
    /// verification mode requires, verifying once the stream ends.
    fn fetch_verify_stage(
        &self,
        url: &str,
        stage_path: &Path,
        verify: &CandidateVerify,
        chunk_size: usize,
    ) -> Result<(), OtaError> {
        let mut resp = self.fetcher.get(url, true)?;
        let mut writer = AtomicFileWriter::create(stage_path)?;

        let mut sha1 = match verify {
            CandidateVerify::GitBlob { size, .. } => {
                let mut h = Sha1::new();
                h.update(b"blob ");
                h.update(size.to_string().as_bytes());
                h.update(b"\0");
                Some(h)
            }
            CandidateVerify::Stable { .. } => None,
        };
        let want_sha256 = matches!(verify, CandidateVerify::Stable { sha256: Some(_), .. });
        let want_crc32 = matches!(verify, CandidateVerify::Stable { sha256: None, crc32: Some(_), .. });
        let mut sha256 = if want_sha256 { Some(Sha256::new()) } else { None };
        let mut crc32 = if want_crc32 { Some(Crc32Hasher::new()) } else { None };

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut total: u64 = 0;
        loop {
            let n = resp
                .read(&mut buf)
                .map_err(|e| OtaError::Network(format!("stream read failed: {e}")))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            if let Some(h) = sha1.as_mut() {
                h.update(&buf[..n]);
            }
            if let Some(h) = sha256.as_mut() {
                h.update(&buf[..n]);
            }
            if let Some(h) = crc32.as_mut() {
                h.update(&buf[..n]);
            }
            total += n as u64;
            self.caps.wdt_feed();
        }

        let sha1_hex = sha1.map(|h| hex::encode(h.finalize()));
        let sha256_hex = sha256.map(|h| hex::encode(h.finalize()));
        let crc32_val = crc32.map(|h| h.finalize());

        if !verify_digest(verify, total, sha1_hex.as_deref(), sha256_hex.as_deref(), crc32_val) {
            writer.abort();
            return Err(OtaError::Integrity(format!(
                "verification failed for staged artifact at {}",
                stage_path.display()
            )));
        }
        writer.commit()?;
        Ok(())
    }
}

/// Where a candidate's downloaded delta body is staged before being
/// applied, alongside (not inside) its eventual output at `stage_path`.
fn delta_tmp_path(stage_path: &Path) -> PathBuf {
    let mut name = stage_path.as_os_str().to_os_string();
    name.push(".delta.tmp");
    PathBuf::from(name)
}

fn verify_digest(
    verify: &CandidateVerify,
    total: u64,
    sha1_hex: Option<&str>,
    sha256_hex: Option<&str>,
    crc32_val: Option<u32>,
) -> bool {
    match verify {
        CandidateVerify::GitBlob { sha, size } => total == *size && sha1_hex == Some(sha.as_str()),
        CandidateVerify::Stable { sha256, crc32, size } => {
            let size_ok = size.map(|s| s == total).unwrap_or(true);
            let hash_ok = if let Some(expected) = sha256 {
                sha256_hex == Some(expected.as_str())
            } else if let Some(expected) = crc32 {
                crc32_val == Some(*expected)
            } else {
                false
            };
            size_ok && hash_ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_limits_reject_too_many_files() {
        let mut cfg_toml = String::from("owner = \"acme\"\nrepo = \"widget\"\n");
        cfg_toml.push_str("max_tree_files = 2\n");
        let cfg = Config::from_toml_str(&cfg_toml).unwrap();
        assert!(enforce_tree_limits(&cfg, 3, None).is_err());
        assert!(enforce_tree_limits(&cfg, 2, None).is_ok());
    }

    #[test]
    fn tree_limits_reject_oversized_tree() {
        let mut cfg_toml = String::from("owner = \"acme\"\nrepo = \"widget\"\n");
        cfg_toml.push_str("max_tree_size_kb = 100\n");
        let cfg = Config::from_toml_str(&cfg_toml).unwrap();
        assert!(enforce_tree_limits(&cfg, 1, Some(200)).is_err());
        assert!(enforce_tree_limits(&cfg, 1, Some(50)).is_ok());
    }

    #[test]
    fn verify_digest_git_blob_checks_size_and_sha() {
        let verify = CandidateVerify::GitBlob { sha: "abc".into(), size: 4 };
        assert!(verify_digest(&verify, 4, Some("abc"), None, None));
        assert!(!verify_digest(&verify, 5, Some("abc"), None, None));
        assert!(!verify_digest(&verify, 4, Some("def"), None, None));
    }

    #[test]
    fn verify_digest_stable_prefers_sha256_over_crc32() {
        let verify = CandidateVerify::Stable {
            sha256: Some("abc".into()),
            crc32: Some(0x1234),
            size: Some(4),
        };
        // A matching CRC32 does not help if SHA-256 was requested and wrong.
        assert!(!verify_digest(&verify, 4, None, Some("wrong"), Some(0x1234)));
        assert!(verify_digest(&verify, 4, None, Some("abc"), Some(0x1234)));
    }

    #[test]
    fn verify_digest_falls_back_to_crc32_when_sha256_absent() {
        let verify = CandidateVerify::Stable {
            sha256: None,
            crc32: Some(0x1234),
            size: None,
        };
        assert!(verify_digest(&verify, 4, None, None, Some(0x1234)));
        assert!(!verify_digest(&verify, 4, None, None, Some(0x9999)));
    }

    #[test]
    fn identity_matches_requires_matching_size_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("app.bin");
        std::fs::write(&live, b"demo").unwrap();

        let caps = crate::capabilities::NullCapabilities;
        let cfg_toml = "owner = \"acme\"\nrepo = \"widget\"\n";
        let cfg = Config::from_toml_str(cfg_toml).unwrap();
        let fetcher = Fetcher::new(&cfg, &caps).unwrap();
        let coordinator = StagingCoordinator::new(&cfg, &fetcher, &caps, dir.path());

        let matching = CandidateVerify::Stable {
            sha256: Some("2a97516c354b68848cdbd8f54a226a0a55b21ed138e207ad6c5cbb9c00aa5aea".into()),
            crc32: None,
            size: Some(4),
        };
        assert!(coordinator.identity_matches(&live, &matching, 64).unwrap());

        let wrong_size = CandidateVerify::Stable {
            sha256: Some("2a97516c354b68848cdbd8f54a226a0a55b21ed138e207ad6c5cbb9c00aa5aea".into()),
            crc32: None,
            size: Some(999),
        };
        assert!(!coordinator.identity_matches(&live, &wrong_size, 64).unwrap());
    }
}
