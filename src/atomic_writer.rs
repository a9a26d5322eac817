//! Atomic file writer: `write -> flush -> fsync -> rename`, with `.tmp`
//! cleanup on any failure before rename and a directory sync after a
//! successful rename.

use crate::error::OtaError;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct AtomicFileWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

impl AtomicFileWriter {
    pub fn create(final_path: &Path) -> Result<Self, OtaError> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| OtaError::io_fault(parent.to_path_buf(), e))?;
        }
        let tmp_path = tmp_name(final_path);
        let file = File::create(&tmp_path).map_err(|e| OtaError::io_fault(tmp_path.clone(), e))?;
        Ok(Self {
            tmp_path,
            final_path: final_path.to_path_buf(),
            file,
        })
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), OtaError> {
        self.file
            .write_all(buf)
            .map_err(|e| OtaError::io_fault(self.tmp_path.clone(), e))
    }

    /// Flushes, fsyncs, closes and renames into place. On success, issues a
    /// directory sync on the destination's parent so the rename itself
    /// survives a crash.
    pub fn commit(self) -> Result<PathBuf, OtaError> {
        let AtomicFileWriter {
            tmp_path,
            final_path,
            mut file,
        } = self;
        file.flush().map_err(|e| OtaError::io_fault(tmp_path.clone(), e))?;
        file.sync_all().map_err(|e| OtaError::io_fault(tmp_path.clone(), e))?;
        drop(file);
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| OtaError::io_fault(final_path.clone(), e))?;
        if let Some(parent) = final_path.parent() {
            let _ = fsync_dir(parent);
        }
        Ok(final_path)
    }

    /// Aborts the write, removing the `.tmp` file. Called explicitly on any
    /// verification failure before `commit`.
    pub fn abort(self) {
        let _ = fs::remove_file(&self.tmp_path);
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }
}

fn tmp_name(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> Result<(), OtaError> {
    let dir = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| OtaError::io_fault(path.to_path_buf(), e))?;
    dir.sync_all().map_err(|e| OtaError::io_fault(path.to_path_buf(), e))
}

#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> Result<(), OtaError> {
    Ok(())
}

/// Boot-recovery helper: removes any stray `.tmp` files found under
/// `stage_dir` (walked recursively).
pub fn remove_stray_tmp_files(stage_dir: &Path) -> Result<usize, OtaError> {
    let mut removed = 0;
    if !stage_dir.exists() {
        return Ok(0);
    }
    for entry in walkdir::WalkDir::new(stage_dir) {
        let entry = entry.map_err(|e| {
            OtaError::io_fault(stage_dir.to_path_buf(), std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        if entry.file_type().is_file() && entry.path().extension().map(|e| e == "tmp").unwrap_or(false)
        {
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn happy_path_write_then_read_back() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("file.txt");
        let mut w = AtomicFileWriter::create(&dest).unwrap();
        w.write_all(b"hello").unwrap();
        let path = w.commit().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(!dir.path().join("file.txt.tmp").exists());
    }

    #[test]
    fn abort_removes_tmp_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("file.txt");
        let mut w = AtomicFileWriter::create(&dest).unwrap();
        w.write_all(b"partial").unwrap();
        let tmp = w.tmp_path().to_path_buf();
        w.abort();
        assert!(!tmp.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn stray_tmp_files_removed_under_stage() {
        let dir = tempdir().unwrap();
        let stage = dir.path().join("stage");
        fs::create_dir_all(stage.join("sub")).unwrap();
        fs::write(stage.join("a.tmp"), b"x").unwrap();
        fs::write(stage.join("sub").join("b.tmp"), b"y").unwrap();
        fs::write(stage.join("keep.txt"), b"z").unwrap();
        let removed = remove_stray_tmp_files(&stage).unwrap();
        assert_eq!(removed, 2);
        assert!(stage.join("keep.txt").exists());
    }
}
