//! Content hasher.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use beatsync_protocol::Digest;
use sha2::{Digest as _, Sha256};

use crate::TransferError;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Computes the SHA-256 digest of `data`.
pub fn digest(data: &[u8]) -> Digest {
    Digest::from_bytes(Sha256::digest(data).into())
}

/// Hashes exactly `length` bytes of `file` starting at `offset`.
///
/// Fails with an `UnexpectedEof` I/O error if the file ends early
/// (truncated or corrupt local file).
pub fn digest_chunk(file: &mut File, offset: u64, length: u32) -> Result<Digest, TransferError> {
    file.seek(SeekFrom::Start(offset))?;
    let mut hasher = Sha256::new();
    let mut remaining = length as usize;
    let mut buf = vec![0u8; READ_BUF_SIZE.min(remaining.max(1))];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "expected {length} bytes at offset {offset}, file ended {remaining} bytes short"
                ),
            )
            .into());
        }
        hasher.update(&buf[..n]);
        remaining -= n;
    }
    Ok(Digest::from_bytes(hasher.finalize().into()))
}

/// Computes the SHA-256 digest of an entire file.
pub fn digest_file(path: &Path) -> Result<Digest, TransferError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest::from_bytes(hasher.finalize().into()))
}
