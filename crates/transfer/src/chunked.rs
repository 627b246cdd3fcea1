use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use beatsync_protocol::Digest;

use crate::TransferError;
use crate::hash::digest_chunk;
use crate::plan::ChunkRange;
use crate::validation::validate_relative_path;

const PART_SUFFIX: &str = ".part";

/// Returns the in-progress download path for `dest` (`<dest>.part`).
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Resolves a manifest-relative path under `root`, rejecting traversal.
fn resolve(root: &Path, relative_path: &str) -> Result<PathBuf, TransferError> {
    validate_relative_path(relative_path)?;
    Ok(root.join(relative_path))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads chunk ranges of a local source file.
///
/// Every read opens its own handle, so one reader can serve concurrent
/// chunk tasks reading disjoint ranges.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
}

impl ChunkReader {
    /// Creates a reader for `relative_path` under `root`.
    pub fn new(root: &Path, relative_path: &str) -> Result<Self, TransferError> {
        Ok(Self {
            path: resolve(root, relative_path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads exactly the bytes of `range`.
    pub fn read_chunk(&self, range: ChunkRange) -> Result<Vec<u8>, TransferError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(range.offset))?;
        let mut buf = vec![0u8; range.length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Current size of the source file on disk.
    pub fn file_size(&self) -> Result<u64, TransferError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Writes downloaded chunks into `<dest>.part` at exact offsets.
///
/// The part file is renamed onto the destination by [`finalize`](Self::finalize)
/// once every chunk is verified.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    dest: PathBuf,
    part: PathBuf,
    size_bytes: u64,
}

impl ChunkWriter {
    /// Creates a writer for `relative_path` under `root`.
    pub fn new(root: &Path, relative_path: &str, size_bytes: u64) -> Result<Self, TransferError> {
        let dest = resolve(root, relative_path)?;
        let part = part_path(&dest);
        Ok(Self {
            dest,
            part,
            size_bytes,
        })
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest
    }

    pub fn part_path(&self) -> &Path {
        &self.part
    }

    /// Creates parent directories and sizes the part file.
    ///
    /// An existing part file is kept (its verified chunks are resumable).
    pub fn prepare(&self) -> Result<(), TransferError> {
        if let Some(parent) = self.part.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.part)?;
        if file.metadata()?.len() != self.size_bytes {
            file.set_len(self.size_bytes)?;
        }
        Ok(())
    }

    /// Writes `data` at `offset` and flushes it to disk before returning.
    pub fn write_chunk(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        if offset + data.len() as u64 > self.size_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes at {offset} exceeds file size {}",
                    data.len(),
                    self.size_bytes
                ),
            )
            .into());
        }
        let mut file = OpenOptions::new().write(true).open(&self.part)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Re-hashes a chunk already written to the part file.
    pub fn digest_written(&self, range: ChunkRange) -> Result<Digest, TransferError> {
        let mut file = File::open(&self.part)?;
        digest_chunk(&mut file, range.offset, range.length)
    }

    /// Returns `true` if the destination already holds the finished file.
    pub fn is_finalized(&self) -> bool {
        self.dest.is_file() && !self.part.exists()
    }

    /// Moves the completed part file onto the destination path.
    pub fn finalize(&self) -> Result<(), TransferError> {
        std::fs::rename(&self.part, &self.dest)?;
        Ok(())
    }
}
