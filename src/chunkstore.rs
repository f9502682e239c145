use std::sync::Arc;

use crate::datamodel::{FileId, StoredChunk};
use crate::error::Result;

pub type ChunkStorage = Arc<dyn ChunkStore>;

/// Persists the chunks of all files, keyed by `(file_id, seq)`.
///
/// Chunks are append-only: a `(file_id, seq)` pair can be written once and is
/// only ever removed together with all other chunks of that file.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    async fn put_chunk(&self, file_id: FileId, seq: u32, chunk: StoredChunk) -> Result<()>;

    /// Fails with `ChunkNotFound` if the chunk does not exist.
    async fn get_chunk(&self, file_id: FileId, seq: u32) -> Result<StoredChunk>;

    /// Removes all chunks of `file_id`, returning how many were removed.
    ///
    /// Removing the chunks of an unknown file is not an error and returns `0`.
    async fn delete_chunks(&self, file_id: FileId) -> Result<u64>;

    async fn count_chunks(&self, file_id: FileId) -> Result<u64>;
}
