//! Content hasher: streaming SHA-256, CRC-32 and git "blob identity"
//! hashing over bounded buffers. A chunked read loop feeds an
//! incremental hasher, never materializing the whole artifact in memory.

use crate::error::OtaError;
use crc32fast::Hasher as Crc32Hasher;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Any bounded chunk source the hasher can stream from. Implemented for
/// `std::fs::File` and in-memory slices via the blanket `Read` impl below.
pub trait ChunkSource {
    /// Reads up to `buf.len()` bytes; returns `0` only at EOF.
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl<R: Read> ChunkSource for R {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read(buf)
    }
}

fn stream_chunks<S: ChunkSource>(
    source: &mut S,
    chunk_size: usize,
    mut on_chunk: impl FnMut(&[u8]),
) -> Result<u64, OtaError> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = source
            .read_chunk(&mut buf)
            .map_err(|e| OtaError::Network(format!("read failed: {e}")))?;
        if n == 0 {
            break;
        }
        on_chunk(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

pub fn sha256_stream<S: ChunkSource>(source: &mut S, chunk_size: usize) -> Result<String, OtaError> {
    let mut hasher = Sha256::new();
    stream_chunks(source, chunk_size, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path, chunk_size: usize) -> Result<String, OtaError> {
    let mut f = File::open(path).map_err(|e| OtaError::io_fault(path.to_path_buf(), e))?;
    sha256_stream(&mut f, chunk_size)
}

pub fn crc32_stream<S: ChunkSource>(source: &mut S, chunk_size: usize) -> Result<u32, OtaError> {
    let mut hasher = Crc32Hasher::new();
    stream_chunks(source, chunk_size, |chunk| hasher.update(chunk))?;
    Ok(hasher.finalize())
}

pub fn crc32_file(path: &Path, chunk_size: usize) -> Result<u32, OtaError> {
    let mut f = File::open(path).map_err(|e| OtaError::io_fault(path.to_path_buf(), e))?;
    crc32_stream(&mut f, chunk_size)
}

/// Git "blob identity" hash: SHA-1 over `"blob " + decimal_size + "\0" +
/// bytes`. Fails if the number of bytes actually read does not equal
/// `total_size` declared up front.
pub fn git_blob_sha1_stream<S: ChunkSource>(
    source: &mut S,
    total_size: u64,
    chunk_size: usize,
) -> Result<String, OtaError> {
    let mut hasher = Sha1::new();
    hasher.update(b"blob ");
    hasher.update(total_size.to_string().as_bytes());
    hasher.update(b"\0");
    let mut remaining = total_size;
    let read = stream_chunks(source, chunk_size, |chunk| {
        remaining = remaining.saturating_sub(chunk.len() as u64);
        hasher.update(chunk);
    })?;
    if read != total_size || remaining != 0 {
        return Err(OtaError::Integrity(format!(
            "size mismatch during blob hash: declared {total_size}, streamed {read}"
        )));
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn git_blob_sha1_file(path: &Path, total_size: u64, chunk_size: usize) -> Result<String, OtaError> {
    let mut f = File::open(path).map_err(|e| OtaError::io_fault(path.to_path_buf(), e))?;
    git_blob_sha1_stream(&mut f, total_size, chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn sha256_matches_known_vector() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"demo").unwrap();
        let digest = sha256_file(f.path(), 2).unwrap();
        assert_eq!(
            digest,
            "2a97516c354b68848cdbd8f54a226a0a55b21ed138e207ad6c5cbb9c00aa5aea"
        );
    }

    #[test]
    fn crc32_matches_known_vector() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"demo").unwrap();
        let crc = crc32_file(f.path(), 3).unwrap();
        assert_eq!(crc, 0xd642dfa0);
    }

    #[test]
    fn blob_identity_matches_git() {
        // `git hash-object` of the literal bytes "demo" is a well-known value.
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"demo").unwrap();
        let digest = git_blob_sha1_file(f.path(), 4, 2).unwrap();
        assert_eq!(digest, "efd261bf79519c997d1c2ac4154798d551f022dd");
    }

    #[test]
    fn blob_identity_rejects_size_mismatch() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"demo").unwrap();
        let err = git_blob_sha1_file(f.path(), 10, 2).unwrap_err();
        assert!(matches!(err, OtaError::Integrity(_)));
    }
}
