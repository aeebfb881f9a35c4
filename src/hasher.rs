//! Single-pass CRC32 + SHA-1 + MD5 hashing with chunked cancellation.
//!
//! `checksum.rs` hashes with one `Digest` algorithm at a time via
//! `io::copy`. All three digests DAT rows can carry (CRC32, SHA-1, MD5)
//! are needed from a single read pass here, so the copy loop is unrolled
//! manually and every digest is fed from the same buffer. SHA-1 and MD5
//! both go through the shared `digest::Digest` trait rather than two
//! separate algorithm-specific APIs.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crc32fast::Hasher as Crc32Hasher;
use digest::Digest;
use md5::Md5;
use sha1::Sha1;

use crate::cancel::CancelToken;
use crate::error::{Result, RomSorterError};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashes {
    pub crc32_hex: String,
    pub sha1_hex: String,
    pub md5_hex: String,
    pub size_bytes: u64,
}

pub fn clamp_chunk_size(requested: usize) -> usize {
    requested.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Hash `path` with CRC32 + SHA-1 in a single pass, checking `cancel`
/// after each chunk. Leaves no partial state behind on cancellation —
/// the caller simply receives `Err(Cancelled)` and nothing was written.
pub fn hash_file(path: &Path, cancel: &CancelToken, chunk_size: usize) -> Result<FileHashes> {
    let chunk_size = clamp_chunk_size(chunk_size);
    let mut file = File::open(path).map_err(|e| RomSorterError::io(path, e))?;
    hash_reader(&mut file, cancel, chunk_size)
}

pub fn hash_reader<R: Read>(
    reader: &mut R,
    cancel: &CancelToken,
    chunk_size: usize,
) -> Result<FileHashes> {
    let chunk_size = clamp_chunk_size(chunk_size);
    let mut crc = Crc32Hasher::new();
    let mut sha1 = Sha1::new();
    let mut md5 = Md5::new();
    let mut buf = vec![0u8; chunk_size];
    let mut total: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RomSorterError::Cancelled);
        }
        let n = reader
            .read(&mut buf)
            .map_err(|e| RomSorterError::io(Path::new(""), e))?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
        sha1.update(&buf[..n]);
        md5.update(&buf[..n]);
        total += n as u64;
        if cancel.is_cancelled() {
            return Err(RomSorterError::Cancelled);
        }
    }

    Ok(FileHashes {
        crc32_hex: format!("{:08x}", crc.finalize()),
        sha1_hex: format!("{:040x}", sha1.finalize()),
        md5_hex: format!("{:032x}", md5.finalize()),
        size_bytes: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    #[test]
    fn known_vector_empty_input() {
        let cancel = CancelToken::new();
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let hashes = hash_reader(&mut cursor, &cancel, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(hashes.crc32_hex, "00000000");
        assert_eq!(hashes.sha1_hex, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(hashes.md5_hex, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hashes.size_bytes, 0);
    }

    #[test]
    fn known_vector_abc() {
        let cancel = CancelToken::new();
        let mut cursor = Cursor::new(b"abc".to_vec());
        let hashes = hash_reader(&mut cursor, &cancel, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(hashes.crc32_hex, "352441c2");
        assert_eq!(hashes.sha1_hex, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(hashes.md5_hex, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn cancels_cleanly() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut cursor = Cursor::new(vec![0u8; 4096]);
        let result = hash_reader(&mut cursor, &cancel, DEFAULT_CHUNK_SIZE);
        assert!(matches!(result, Err(RomSorterError::Cancelled)));
    }

    #[test]
    fn hashes_file_on_disk() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"abc").unwrap();
        let cancel = CancelToken::new();
        let hashes = hash_file(file.path(), &cancel, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(hashes.sha1_hex, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(hashes.size_bytes, 3);
    }

    #[test]
    fn clamps_chunk_size_to_bounds() {
        assert_eq!(clamp_chunk_size(1), MIN_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(usize::MAX), MAX_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(DEFAULT_CHUNK_SIZE), DEFAULT_CHUNK_SIZE);
    }
}
