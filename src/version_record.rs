//! Installed-version record: the single fact on disk that says what is
//! currently installed. Written strictly last in the swap protocol,
//! after every file move has landed, so a crash before this write looks
//! like "no prior version" on the next boot rather than a half-applied
//! update. Written atomically via a `.tmp` file, fsync, rename.

use crate::atomic_writer::AtomicFileWriter;
use crate::error::OtaError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const VERSION_FILE: &str = "version.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRecord {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub commit: String,
}

impl VersionRecord {
    pub fn new(ref_: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            ref_: ref_.into(),
            commit: commit.into(),
        }
    }

    /// Reads the installed-version record at `root/version.json`. A
    /// missing file is not an error: it means no version is installed yet
    /// (first run, or recovery from a crash before the record was ever
    /// written), so the caller treats `None` as "install from scratch".
    pub fn read(root: &Path) -> Result<Option<Self>, OtaError> {
        let path = root.join(VERSION_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let record = serde_json::from_str(&text)
                    .map_err(|e| OtaError::State(format!("corrupt version record: {e}")))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OtaError::io_fault(path, e)),
        }
    }

    pub fn write(&self, root: &Path) -> Result<(), OtaError> {
        let path = root.join(VERSION_FILE);
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| OtaError::State(format!("failed to serialize version record: {e}")))?;
        let mut writer = AtomicFileWriter::create(&path)?;
        writer.write_all(&body)?;
        writer.commit()?;
        Ok(())
    }
}
