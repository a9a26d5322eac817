//! Storage probe: reports free RAM and free filesystem bytes; used to
//! adapt the I/O chunk size and to gate staging behind a pre-flight
//! free-space check.

use crate::capabilities::Capabilities;

pub const MIN_CHUNK: usize = 256;
pub const MAX_CHUNK: usize = 4096;

pub struct StorageProbe<'a> {
    caps: &'a dyn Capabilities,
}

impl<'a> StorageProbe<'a> {
    pub fn new(caps: &'a dyn Capabilities) -> Self {
        Self { caps }
    }

    pub fn free_mem(&self) -> Option<u64> {
        self.caps.mem_free().or_else(proc_statm_free_bytes)
    }

    pub fn free_storage(&self, path: &std::path::Path) -> Option<u64> {
        self.caps.storage_free().or_else(|| statvfs_free_bytes(path))
    }

    /// Adapts the configured chunk size to available memory: bounded
    /// between `MIN_CHUNK` and `MAX_CHUNK`, and never more than a quarter
    /// of free memory.
    pub fn adapt_chunk_size(&self, configured: usize) -> usize {
        let size = configured.clamp(MIN_CHUNK, MAX_CHUNK);
        match self.free_mem() {
            Some(free) => size.min((free / 4).max(1) as usize),
            None => size,
        }
    }
}

#[cfg(target_os = "linux")]
fn proc_statm_free_bytes() -> Option<u64> {
    // No universal "free RAM" syscall without extra dependencies; on Linux
    // we approximate using MemAvailable from /proc/meminfo, which is the
    // same source most userspace tools use.
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn proc_statm_free_bytes() -> Option<u64> {
    None
}

#[cfg(unix)]
fn statvfs_free_bytes(path: &std::path::Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: `stat` is zero-initialized and only read after a successful
    // FFI call that fills it in.
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(cpath.as_ptr(), &mut stat) != 0 {
            return None;
        }
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn statvfs_free_bytes(_path: &std::path::Path) -> Option<u64> {
    None
}
