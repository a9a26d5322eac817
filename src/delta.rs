//! Delta applier: applies a block-instruction binary patch against an
//! existing file in one streaming pass, bounded to a 64-byte lookahead
//! buffer plus the caller's chunk size. The streaming mode is the
//! canonical path; an in-memory buffer is just a trivial stream over it.
//! A block hash-table diff producer is included for the host-side test
//! harness that generates patches.

use crate::error::OtaError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const DELTA_MAGIC: &[u8; 8] = b"OTADELTA";
pub const DELTA_VERSION: u8 = 1;

pub const OP_COPY_OLD: u8 = 0x01;
pub const OP_NEW_DATA: u8 = 0x02;
pub const OP_END: u8 = 0xFF;

pub const MAX_COPY_SIZE: u64 = 4096;
pub const MAX_INSERT_SIZE: u64 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("invalid delta magic")]
    BadMagic,
    #[error("unsupported delta version: {0}")]
    BadVersion(u8),
    #[error("unexpected end of delta stream")]
    Truncated,
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("copy length {0} exceeds limit {MAX_COPY_SIZE}")]
    CopyTooLarge(u64),
    #[error("insert length {0} exceeds limit {MAX_INSERT_SIZE}")]
    InsertTooLarge(u64),
    #[error("unexpected EOF reading old file at offset {0}")]
    OldFileEof(u64),
    #[error("output hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<DeltaError> for OtaError {
    fn from(e: DeltaError) -> Self {
        OtaError::Integrity(e.to_string())
    }
}

/// A byte source for delta instructions. The streaming reader
/// (`FileDeltaSource`) holds only a `BUFFER_SIZE`-byte lookahead; an
/// in-memory `SliceDeltaSource` is a trivial wrapper around a byte
/// buffer, per the Design Notes' "two delta modes collapse to a single
/// trait" guidance.
pub trait DeltaSource {
    fn read_byte(&mut self) -> Result<Option<u8>, DeltaError>;
    fn read_bytes(&mut self, n: usize, out: &mut dyn FnMut(&[u8]) -> Result<(), DeltaError>) -> Result<(), DeltaError>;
}

const BUFFER_SIZE: usize = 64;

pub struct FileDeltaSource {
    file: File,
    buffer: [u8; BUFFER_SIZE],
    pos: usize,
    len: usize,
    eof: bool,
}

impl FileDeltaSource {
    pub fn open(path: &Path) -> Result<Self, DeltaError> {
        Ok(Self {
            file: File::open(path)?,
            buffer: [0u8; BUFFER_SIZE],
            pos: 0,
            len: 0,
            eof: false,
        })
    }

    fn refill(&mut self) -> Result<bool, DeltaError> {
        if self.pos < self.len {
            return Ok(true);
        }
        if self.eof {
            return Ok(false);
        }
        let n = self.file.read(&mut self.buffer)?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.pos = 0;
        self.len = n;
        Ok(true)
    }
}

impl DeltaSource for FileDeltaSource {
    fn read_byte(&mut self) -> Result<Option<u8>, DeltaError> {
        if !self.refill()? {
            return Ok(None);
        }
        let b = self.buffer[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    fn read_bytes(&mut self, mut n: usize, out: &mut dyn FnMut(&[u8]) -> Result<(), DeltaError>) -> Result<(), DeltaError> {
        while n > 0 {
            if !self.refill()? {
                return Err(DeltaError::Truncated);
            }
            let avail = (self.len - self.pos).min(n);
            out(&self.buffer[self.pos..self.pos + avail])?;
            self.pos += avail;
            n -= avail;
        }
        Ok(())
    }
}

pub struct SliceDeltaSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceDeltaSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> DeltaSource for SliceDeltaSource<'a> {
    fn read_byte(&mut self) -> Result<Option<u8>, DeltaError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    fn read_bytes(&mut self, n: usize, out: &mut dyn FnMut(&[u8]) -> Result<(), DeltaError>) -> Result<(), DeltaError> {
        if self.pos + n > self.data.len() {
            return Err(DeltaError::Truncated);
        }
        out(&self.data[self.pos..self.pos + n])?;
        self.pos += n;
        Ok(())
    }
}

fn read_varint(source: &mut dyn DeltaSource) -> Result<u64, DeltaError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = source.read_byte()?.ok_or(DeltaError::Truncated)?;
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 35 {
            return Err(DeltaError::Truncated);
        }
    }
    Ok(result)
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

/// Applies `delta` to `old_path`, producing `output_path`, verifying the
/// header, enforcing the copy/insert size limits, and (if `expected_hash`
/// is given) the output SHA-256. Peak buffered bytes stay at
/// `BUFFER_SIZE + chunk_size` regardless of delta size.
pub fn apply_delta(
    old_path: &Path,
    source: &mut dyn DeltaSource,
    output_path: &Path,
    expected_hash: Option<&str>,
    chunk_size: usize,
) -> Result<String, OtaError> {
    apply_delta_inner(old_path, source, output_path, expected_hash, chunk_size)
        .map_err(OtaError::from)
}

fn apply_delta_inner(
    old_path: &Path,
    source: &mut dyn DeltaSource,
    output_path: &Path,
    expected_hash: Option<&str>,
    chunk_size: usize,
) -> Result<String, DeltaError> {
    let mut magic = [0u8; 8];
    {
        let mut i = 0;
        source.read_bytes(8, &mut |chunk| {
            magic[i..i + chunk.len()].copy_from_slice(chunk);
            i += chunk.len();
            Ok(())
        })?;
    }
    if &magic != DELTA_MAGIC {
        return Err(DeltaError::BadMagic);
    }
    let version = source.read_byte()?.ok_or(DeltaError::Truncated)?;
    if version != DELTA_VERSION {
        return Err(DeltaError::BadVersion(version));
    }

    let mut old_file = File::open(old_path)?;
    let mut output_hash = Sha256::new();
    let chunk_size = chunk_size.max(1);

    let tmp_path = {
        let mut p = output_path.as_os_str().to_os_string();
        p.push(".tmp");
        std::path::PathBuf::from(p)
    };
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut new_file = File::create(&tmp_path)?;

    loop {
        let opcode = source.read_byte()?.ok_or(DeltaError::Truncated)?;
        match opcode {
            OP_END => break,
            OP_COPY_OLD => {
                let copy_offset = read_varint(source)?;
                let copy_length = read_varint(source)?;
                if copy_length > MAX_COPY_SIZE {
                    return Err(DeltaError::CopyTooLarge(copy_length));
                }
                old_file.seek(SeekFrom::Start(copy_offset))?;
                let mut remaining = copy_length;
                let mut buf = vec![0u8; chunk_size];
                while remaining > 0 {
                    let want = remaining.min(chunk_size as u64) as usize;
                    let n = old_file.read(&mut buf[..want])?;
                    if n != want {
                        return Err(DeltaError::OldFileEof(copy_offset));
                    }
                    new_file.write_all(&buf[..n])?;
                    output_hash.update(&buf[..n]);
                    remaining -= n as u64;
                }
            }
            OP_NEW_DATA => {
                let insert_length = read_varint(source)?;
                if insert_length > MAX_INSERT_SIZE {
                    return Err(DeltaError::InsertTooLarge(insert_length));
                }
                let mut remaining = insert_length as usize;
                while remaining > 0 {
                    let want = remaining.min(chunk_size);
                    source.read_bytes(want, &mut |chunk| {
                        new_file.write_all(chunk)?;
                        output_hash.update(chunk);
                        Ok(())
                    })?;
                    remaining -= want;
                }
            }
            other => return Err(DeltaError::UnknownOpcode(other)),
        }
    }

    new_file.flush()?;
    new_file.sync_all()?;
    drop(new_file);
    std::fs::rename(&tmp_path, output_path)?;

    let result_hash = hex::encode(output_hash.finalize());
    if let Some(expected) = expected_hash {
        if expected != result_hash {
            let _ = std::fs::remove_file(output_path);
            return Err(DeltaError::HashMismatch {
                expected: expected.to_string(),
                actual: result_hash,
            });
        }
    }
    Ok(result_hash)
}

/// Host-side delta producer: a simple block-hash-table diff, deliberately
/// non-optimal. Used by tests and intended for a future host-side tool,
/// not exposed through the device CLI.
pub fn create_delta(old_path: &Path, new_path: &Path, block_size: usize) -> Result<Vec<u8>, OtaError> {
    let old_data = std::fs::read(old_path).map_err(|e| OtaError::io_fault(old_path.to_path_buf(), e))?;
    let new_data = std::fs::read(new_path).map_err(|e| OtaError::io_fault(new_path.to_path_buf(), e))?;
    Ok(create_delta_bytes(&old_data, &new_data, block_size))
}

pub fn create_delta_bytes(old_data: &[u8], new_data: &[u8], block_size: usize) -> Vec<u8> {
    let block_size = block_size.max(1);
    let mut old_blocks: std::collections::HashMap<[u8; 8], Vec<usize>> = std::collections::HashMap::new();
    let mut i = 0;
    while i < old_data.len() {
        let end = (i + block_size).min(old_data.len());
        let block = &old_data[i..end];
        let mut digest = [0u8; 8];
        digest.copy_from_slice(&Sha256::digest(block)[..8]);
        old_blocks.entry(digest).or_default().push(i);
        i += block_size;
    }

    let mut delta = Vec::new();
    delta.extend_from_slice(DELTA_MAGIC);
    delta.push(DELTA_VERSION);

    let mut new_pos = 0usize;
    let mut pending_insert: Vec<u8> = Vec::new();

    let flush_insert = |delta: &mut Vec<u8>, pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            delta.push(OP_NEW_DATA);
            write_varint(pending.len() as u64, delta);
            delta.extend_from_slice(pending);
            pending.clear();
        }
    };

    while new_pos < new_data.len() {
        let mut matched = false;
        if new_pos + block_size <= new_data.len() {
            let block = &new_data[new_pos..new_pos + block_size];
            let mut digest = [0u8; 8];
            digest.copy_from_slice(&Sha256::digest(block)[..8]);
            if let Some(positions) = old_blocks.get(&digest) {
                let old_pos = positions[0];
                let mut match_len = block_size;
                while new_pos + match_len < new_data.len()
                    && old_pos + match_len < old_data.len()
                    && new_data[new_pos + match_len] == old_data[old_pos + match_len]
                    && (match_len as u64) < MAX_COPY_SIZE
                {
                    match_len += 1;
                }
                flush_insert(&mut delta, &mut pending_insert);
                delta.push(OP_COPY_OLD);
                write_varint(old_pos as u64, &mut delta);
                write_varint(match_len as u64, &mut delta);
                new_pos += match_len;
                matched = true;
            }
        }
        if !matched {
            pending_insert.push(new_data[new_pos]);
            new_pos += 1;
            if pending_insert.len() as u64 >= MAX_INSERT_SIZE {
                flush_insert(&mut delta, &mut pending_insert);
            }
        }
    }
    flush_insert(&mut delta, &mut pending_insert);
    delta.push(OP_END);
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn round_trip_small_edit() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        let new_path = dir.path().join("new.bin");
        let out_path = dir.path().join("out.bin");

        let mut old_data = vec![0u8; 5000];
        for (i, b) in old_data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut new_data = old_data.clone();
        for b in new_data.iter_mut().skip(2000).take(1000) {
            *b = b.wrapping_add(1);
        }
        std::fs::write(&old_path, &old_data).unwrap();
        std::fs::write(&new_path, &new_data).unwrap();

        let delta = create_delta(&old_path, &new_path, 256).unwrap();
        let mut src = SliceDeltaSource::new(&delta);
        let expected = sha256_hex(&new_data);
        let got = apply_delta(&old_path, &mut src, &out_path, Some(&expected), 512).unwrap();
        assert_eq!(got, expected);
        assert_eq!(std::fs::read(&out_path).unwrap(), new_data);
    }

    #[test]
    fn streaming_source_matches_slice_source() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        let new_path = dir.path().join("new.bin");
        let delta_path = dir.path().join("patch.delta");
        let out_path = dir.path().join("out.bin");

        std::fs::write(&old_path, b"hello world, this is the old content").unwrap();
        std::fs::write(&new_path, b"hello world, this is the NEW content!!").unwrap();
        let delta = create_delta(&old_path, &new_path, 8).unwrap();
        std::fs::write(&delta_path, &delta).unwrap();

        let mut file_src = FileDeltaSource::open(&delta_path).unwrap();
        let expected = sha256_hex(&std::fs::read(&new_path).unwrap());
        let got = apply_delta(&old_path, &mut file_src, &out_path, Some(&expected), 4).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn copy_length_at_limit_accepted_over_limit_rejected() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        std::fs::write(&old_path, vec![7u8; 8192]).unwrap();

        let accepted = build_single_copy_delta(0, MAX_COPY_SIZE);
        let mut src = SliceDeltaSource::new(&accepted);
        let out_path = dir.path().join("ok.bin");
        assert!(apply_delta(&old_path, &mut src, &out_path, None, 512).is_ok());

        let rejected = build_single_copy_delta(0, MAX_COPY_SIZE + 1);
        let mut src2 = SliceDeltaSource::new(&rejected);
        let out_path2 = dir.path().join("bad.bin");
        let err = apply_delta(&old_path, &mut src2, &out_path2, None, 512).unwrap_err();
        assert!(matches!(err, OtaError::Integrity(_)));
    }

    #[test]
    fn insert_length_at_limit_accepted_over_limit_rejected() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        std::fs::write(&old_path, b"irrelevant").unwrap();

        let accepted = build_single_insert_delta(MAX_INSERT_SIZE as usize);
        let mut src = SliceDeltaSource::new(&accepted);
        let out_path = dir.path().join("ok.bin");
        assert!(apply_delta(&old_path, &mut src, &out_path, None, 512).is_ok());

        let rejected = build_single_insert_delta(MAX_INSERT_SIZE as usize + 1);
        let mut src2 = SliceDeltaSource::new(&rejected);
        let out_path2 = dir.path().join("bad.bin");
        let err = apply_delta(&old_path, &mut src2, &out_path2, None, 512).unwrap_err();
        assert!(matches!(err, OtaError::Integrity(_)));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        std::fs::write(&old_path, b"x").unwrap();
        let mut bogus = b"NOTADELTA".to_vec();
        bogus.push(OP_END);
        let mut src = SliceDeltaSource::new(&bogus);
        let out_path = dir.path().join("out.bin");
        let err = apply_delta(&old_path, &mut src, &out_path, None, 64).unwrap_err();
        assert!(matches!(err, OtaError::Integrity(_)));
    }

    fn build_single_copy_delta(offset: u64, length: u64) -> Vec<u8> {
        let mut delta = Vec::new();
        delta.extend_from_slice(DELTA_MAGIC);
        delta.push(DELTA_VERSION);
        delta.push(OP_COPY_OLD);
        write_varint(offset, &mut delta);
        write_varint(length, &mut delta);
        delta.push(OP_END);
        delta
    }

    fn build_single_insert_delta(length: usize) -> Vec<u8> {
        let mut delta = Vec::new();
        delta.extend_from_slice(DELTA_MAGIC);
        delta.push(DELTA_VERSION);
        delta.push(OP_NEW_DATA);
        write_varint(length as u64, &mut delta);
        delta.extend(std::iter::repeat(0xABu8).take(length));
        delta.push(OP_END);
        delta
    }
}
