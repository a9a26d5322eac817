//! Swap orchestrator and boot recovery: moves staged artifacts into the
//! live tree, keeps a reverse-order rollback log, applies deletions, and
//! writes the installed-version record strictly last. The rollback log
//! is an ordered sequence of `New`/`Replace`/`Delete` operations, unwound
//! in reverse on any failure.

use crate::atomic_writer::{fsync_dir, remove_stray_tmp_files};
use crate::error::OtaError;
use crate::version_record::VersionRecord;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const ERROR_LOG: &str = "ota_error.json";

fn is_under_dir(rel: &str, dir_name: &str) -> bool {
    rel == dir_name || rel.starts_with(&format!("{dir_name}/"))
}

/// One entry in the swap operation log, in application order. Rollback
/// walks this log in reverse.
#[derive(Debug, Clone)]
pub enum SwapOp {
    New { target: PathBuf },
    Replace { target: PathBuf, backup: PathBuf },
    Delete { backup: PathBuf },
}

pub struct SwapOutcome {
    pub applied: usize,
    pub deleted: usize,
}

pub struct SwapOrchestrator {
    root: PathBuf,
    stage_dir: PathBuf,
    backup_dir: PathBuf,
}

impl SwapOrchestrator {
    /// Constructs the orchestrator and immediately runs boot recovery: a
    /// non-empty `backup_dir` means a prior swap was interrupted mid-flight,
    /// so every backed-up file is restored over the live tree before this
    /// call returns.
    pub fn new(root: &Path, stage_dir_name: &str, backup_dir_name: &str) -> Result<Self, OtaError> {
        let orchestrator = Self {
            root: root.to_path_buf(),
            stage_dir: root.join(stage_dir_name),
            backup_dir: root.join(backup_dir_name),
        };
        orchestrator.boot_recovery();
        Ok(orchestrator)
    }

    /// Restores any backed-up files over the live tree, clears the backup
    /// directory, and sweeps stray `.tmp` files out of the stage directory.
    /// Individual restore failures are logged but never abort the rest of
    /// recovery — a partially-recovered device still wants the remaining
    /// files restored.
    fn boot_recovery(&self) {
        if self.backup_dir.exists() {
            if let Err(e) = self.restore_backup_dir() {
                self.log_error("boot_recovery.restore", &e);
            }
            let _ = fs::remove_dir_all(&self.backup_dir);
        }
        if self.stage_dir.exists() {
            if let Err(e) = remove_stray_tmp_files(&self.stage_dir) {
                self.log_error("boot_recovery.stage_cleanup", &e);
            }
            let _ = fs::remove_dir_all(&self.stage_dir);
        }
    }

    fn restore_backup_dir(&self) -> Result<(), OtaError> {
        for entry in walkdir::WalkDir::new(&self.backup_dir) {
            let entry = entry.map_err(|e| {
                OtaError::io_fault(self.backup_dir.clone(), std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.backup_dir)
                .expect("walkdir entries are rooted under backup_dir");
            let target = self.root.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| OtaError::io_fault(parent.to_path_buf(), e))?;
            }
            fs::rename(entry.path(), &target).map_err(|e| OtaError::io_fault(target.clone(), e))?;
            if let Some(parent) = target.parent() {
                let _ = fsync_dir(parent);
            }
        }
        Ok(())
    }

    /// Drains the stage directory into the live tree, applies `deletes`,
    /// optionally sweeps `delete_patterns` against stale live files, then
    /// writes the installed-version record as the final, crash-defining
    /// step. On any failure, every op already applied is rolled back in
    /// reverse order before the original error is returned.
    pub fn run_swap(
        &self,
        deletes: &[String],
        delete_patterns: &[String],
        record: &VersionRecord,
    ) -> Result<SwapOutcome, OtaError> {
        let mut ops: Vec<SwapOp> = Vec::new();
        let mut staged_rels: Vec<String> = Vec::new();

        let result = self.apply_staged_files(&mut ops, &mut staged_rels);
        let result = result.and_then(|()| self.apply_deletes(deletes, &mut ops));
        let result = result.and_then(|()| {
            if delete_patterns.is_empty() {
                Ok(())
            } else {
                self.apply_delete_pattern_sweep(delete_patterns, &staged_rels, &mut ops)
            }
        });

        if let Err(e) = result {
            self.rollback(&ops);
            let _ = fs::remove_dir_all(&self.stage_dir);
            let _ = fs::remove_dir_all(&self.backup_dir);
            return Err(e);
        }

        // Finalization: fsync, then the installed-version record is the
        // last write that makes this swap observable as committed.
        let _ = fsync_dir(&self.root);
        if let Err(e) = record.write(&self.root) {
            self.rollback(&ops);
            let _ = fs::remove_dir_all(&self.stage_dir);
            let _ = fs::remove_dir_all(&self.backup_dir);
            return Err(e);
        }
        let _ = fsync_dir(&self.root);

        let deleted = ops.iter().filter(|op| matches!(op, SwapOp::Delete { .. })).count();
        let applied = ops.len() - deleted;
        let _ = fs::remove_dir_all(&self.backup_dir);
        let _ = fs::remove_dir_all(&self.stage_dir);
        Ok(SwapOutcome { applied, deleted })
    }

    fn apply_staged_files(&self, ops: &mut Vec<SwapOp>, staged_rels: &mut Vec<String>) -> Result<(), OtaError> {
        if !self.stage_dir.exists() {
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(&self.stage_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                OtaError::io_fault(self.stage_dir.clone(), std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.stage_dir)
                .expect("walkdir entries are rooted under stage_dir")
                .to_string_lossy()
                .replace('\\', "/");
            let target = self.root.join(&rel);
            if target.exists() {
                let backup = self.backup_dir.join(&rel);
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent).map_err(|e| OtaError::io_fault(parent.to_path_buf(), e))?;
                }
                fs::rename(&target, &backup).map_err(|e| OtaError::io_fault(target.clone(), e))?;
                if let Some(parent) = target.parent() {
                    let _ = fsync_dir(parent);
                }
                ops.push(SwapOp::Replace { target: target.clone(), backup });
            } else {
                ops.push(SwapOp::New { target: target.clone() });
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| OtaError::io_fault(parent.to_path_buf(), e))?;
            }
            fs::rename(entry.path(), &target).map_err(|e| OtaError::io_fault(target.clone(), e))?;
            if let Some(parent) = target.parent() {
                let _ = fsync_dir(parent);
            }
            staged_rels.push(rel);
        }
        Ok(())
    }

    fn apply_deletes(&self, deletes: &[String], ops: &mut Vec<SwapOp>) -> Result<(), OtaError> {
        for rel in deletes {
            let target = self.root.join(rel);
            if !target.exists() {
                continue;
            }
            let backup = self.backup_dir.join(rel);
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent).map_err(|e| OtaError::io_fault(parent.to_path_buf(), e))?;
            }
            fs::rename(&target, &backup).map_err(|e| OtaError::io_fault(target.clone(), e))?;
            if let Some(parent) = target.parent() {
                let _ = fsync_dir(parent);
            }
            ops.push(SwapOp::Delete { backup });
        }
        Ok(())
    }

    /// Opt-in sweep (Design Note ii): backs up live files that match a
    /// literal `delete_patterns` prefix and were not part of this swap's
    /// staged set. No globbing; a pattern is a plain path prefix.
    fn apply_delete_pattern_sweep(
        &self,
        delete_patterns: &[String],
        staged_rels: &[String],
        ops: &mut Vec<SwapOp>,
    ) -> Result<(), OtaError> {
        for entry in walkdir::WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                OtaError::io_fault(self.root.clone(), std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if is_under_dir(&rel, &self.stage_dir_name()) || is_under_dir(&rel, &self.backup_dir_name()) {
                continue;
            }
            if rel == crate::version_record::VERSION_FILE || rel == ERROR_LOG {
                continue;
            }
            if staged_rels.iter().any(|s| s == &rel) {
                continue;
            }
            let matches = delete_patterns.iter().any(|p| {
                let p = p.trim_end_matches('/');
                rel == p || rel.starts_with(&format!("{p}/"))
            });
            if !matches {
                continue;
            }
            let target = self.root.join(&rel);
            let backup = self.backup_dir.join(&rel);
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent).map_err(|e| OtaError::io_fault(parent.to_path_buf(), e))?;
            }
            fs::rename(&target, &backup).map_err(|e| OtaError::io_fault(target.clone(), e))?;
            if let Some(parent) = target.parent() {
                let _ = fsync_dir(parent);
            }
            ops.push(SwapOp::Delete { backup });
        }
        Ok(())
    }

    fn stage_dir_name(&self) -> String {
        self.stage_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn backup_dir_name(&self) -> String {
        self.backup_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn rollback(&self, ops: &[SwapOp]) {
        for op in ops.iter().rev() {
            let result: Result<(), OtaError> = (|| match op {
                SwapOp::New { target } => {
                    if target.exists() {
                        fs::remove_file(target).map_err(|e| OtaError::io_fault(target.clone(), e))?;
                    }
                    Ok(())
                }
                SwapOp::Replace { target, backup } => {
                    if target.exists() {
                        fs::remove_file(target).map_err(|e| OtaError::io_fault(target.clone(), e))?;
                    }
                    fs::rename(backup, target).map_err(|e| OtaError::io_fault(target.clone(), e))?;
                    Ok(())
                }
                SwapOp::Delete { backup } => {
                    // The original target path was `self.root.join(rel)`
                    // where `rel` is `backup`'s path relative to backup_dir.
                    let rel = backup
                        .strip_prefix(&self.backup_dir)
                        .unwrap_or(backup.as_path());
                    let target = self.root.join(rel);
                    fs::rename(backup, &target).map_err(|e| OtaError::io_fault(target, e))?;
                    Ok(())
                }
            })();
            if let Err(e) = result {
                self.log_error("rollback", &e);
            }
        }
    }

    fn log_error(&self, context: &str, error: &OtaError) {
        let entry = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "context": context,
            "error": error.to_string(),
        });
        let path = self.root.join(ERROR_LOG);
        let line = format!("{entry}\n");
        if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(&path) {
            let _ = f.write_all(line.as_bytes());
        }
        tracing::error!(context, %error, "swap recovery error logged");
    }
}
