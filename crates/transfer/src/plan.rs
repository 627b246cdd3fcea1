//! Chunk planner: fixed-size chunk layout for one file.

use std::fs::File;
use std::path::Path;

use beatsync_protocol::Digest;

use crate::TransferError;
use crate::hash::digest_chunk;

/// Byte range of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u32,
    pub offset: u64,
    pub length: u32,
}

/// Chunk layout of a file with one digest slot per chunk.
///
/// Derived deterministically from the file size and chunk size. Digest slots
/// start empty and are filled either upfront from the local file (uploads) or
/// lazily as chunk bytes arrive (downloads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    file_id: String,
    size_bytes: u64,
    chunk_size: u32,
    total_chunks: u32,
    chunk_digests: Vec<Option<Digest>>,
}

impl ChunkPlan {
    /// Plans `size_bytes` into `ceil(size_bytes / chunk_size)` chunks.
    pub fn new(
        file_id: impl Into<String>,
        size_bytes: u64,
        chunk_size: u32,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize {
                size_bytes,
                chunk_size,
            });
        }
        let total = size_bytes.div_ceil(u64::from(chunk_size));
        let total_chunks = u32::try_from(total).map_err(|_| TransferError::InvalidChunkSize {
            size_bytes,
            chunk_size,
        })?;
        Ok(Self {
            file_id: file_id.into(),
            size_bytes,
            chunk_size,
            total_chunks,
            chunk_digests: vec![None; total_chunks as usize],
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Returns the byte range of chunk `index`.
    ///
    /// The final chunk may be shorter than `chunk_size`.
    pub fn chunk_range(&self, index: u32) -> Result<ChunkRange, TransferError> {
        self.check_index(index)?;
        let offset = u64::from(index) * u64::from(self.chunk_size);
        let length = (self.size_bytes - offset).min(u64::from(self.chunk_size)) as u32;
        Ok(ChunkRange {
            index,
            offset,
            length,
        })
    }

    /// Iterates over every chunk range in index order.
    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.total_chunks).filter_map(|i| self.chunk_range(i).ok())
    }

    /// Returns the digest slot for chunk `index`.
    pub fn digest(&self, index: u32) -> Result<Option<Digest>, TransferError> {
        self.check_index(index)?;
        Ok(self.chunk_digests[index as usize])
    }

    /// Fills the digest slot for chunk `index`.
    pub fn set_digest(&mut self, index: u32, digest: Digest) -> Result<(), TransferError> {
        self.check_index(index)?;
        self.chunk_digests[index as usize] = Some(digest);
        Ok(())
    }

    /// Returns `true` once every slot holds a digest.
    pub fn is_fully_digested(&self) -> bool {
        self.chunk_digests.iter().all(Option::is_some)
    }

    /// Computes every chunk digest upfront from the local source file.
    ///
    /// Fails if the file size on disk no longer matches the planned size.
    pub fn fill_digests_from_file(&mut self, path: &Path) -> Result<(), TransferError> {
        let mut file = File::open(path)?;
        let actual = file.metadata()?.len();
        if actual != self.size_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "{} is {actual} bytes, expected {}",
                    path.display(),
                    self.size_bytes
                ),
            )
            .into());
        }
        for i in 0..self.total_chunks {
            let range = self.chunk_range(i)?;
            let d = digest_chunk(&mut file, range.offset, range.length)?;
            self.chunk_digests[i as usize] = Some(d);
        }
        Ok(())
    }

    fn check_index(&self, index: u32) -> Result<(), TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::InvalidIndex {
                index,
                total: self.total_chunks,
            });
        }
        Ok(())
    }
}
