use std::collections::{BTreeMap, HashMap};

use futures_util::stream::BoxStream;
use parking_lot::RwLock;

use super::*;
use crate::catalog::FileCatalog;
use crate::chunkstore::ChunkStore;
use crate::error::{BucketError, Result};

#[derive(Debug, Default)]
struct Chunks {
    files: HashMap<FileId, BTreeMap<u32, StoredChunk>>,
    used_bytes: u64,
}

#[derive(Debug, Default)]
struct Records {
    /// The record, and its position in `order`.
    files: HashMap<FileId, (u64, FileRecord)>,
    order: BTreeMap<u64, FileId>,
    next_position: u64,
}

/// A volatile store keeping chunks and records in memory.
///
/// Implements both `ChunkStore` and `FileCatalog`.
#[derive(Debug, Default)]
pub struct MemStore {
    chunks: RwLock<Chunks>,
    records: RwLock<Records>,
    /// Upper bound on the stored chunk bytes, if any.
    capacity: Option<u64>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Number of chunk bytes currently held.
    pub fn used_bytes(&self) -> u64 {
        self.chunks.read().used_bytes
    }
}

#[async_trait::async_trait]
impl ChunkStore for MemStore {
    async fn put_chunk(&self, file_id: FileId, seq: u32, chunk: StoredChunk) -> Result<()> {
        let mut chunks = self.chunks.write();
        let chunk_len = chunk.stored_len() as u64;

        if let Some(capacity) = self.capacity {
            if chunks.used_bytes + chunk_len > capacity {
                return Err(BucketError::StorageFull);
            }
        }

        let file_chunks = chunks.files.entry(file_id).or_default();
        if file_chunks.contains_key(&seq) {
            return Err(BucketError::Data(format!(
                "chunk {seq} of file {file_id} was already written"
            )));
        }
        file_chunks.insert(seq, chunk);
        chunks.used_bytes += chunk_len;

        Ok(())
    }

    async fn get_chunk(&self, file_id: FileId, seq: u32) -> Result<StoredChunk> {
        let chunks = self.chunks.read();
        chunks
            .files
            .get(&file_id)
            .and_then(|file_chunks| file_chunks.get(&seq))
            .cloned()
            .ok_or(BucketError::ChunkNotFound { file_id, seq })
    }

    async fn delete_chunks(&self, file_id: FileId) -> Result<u64> {
        let mut chunks = self.chunks.write();
        let Some(file_chunks) = chunks.files.remove(&file_id) else {
            return Ok(0);
        };

        let freed: u64 = file_chunks
            .values()
            .map(|chunk| chunk.stored_len() as u64)
            .sum();
        chunks.used_bytes -= freed;

        Ok(file_chunks.len() as u64)
    }

    async fn count_chunks(&self, file_id: FileId) -> Result<u64> {
        let chunks = self.chunks.read();
        Ok(chunks
            .files
            .get(&file_id)
            .map_or(0, |file_chunks| file_chunks.len() as u64))
    }
}

#[async_trait::async_trait]
impl FileCatalog for MemStore {
    async fn create_record(&self, new_file: NewFile) -> Result<FileRecord> {
        new_file.validate()?;

        let mut records = self.records.write();
        let id = match new_file.id {
            Some(id) if records.files.contains_key(&id) => {
                return Err(BucketError::AlreadyExists(id));
            }
            Some(id) => id,
            None => FileId::generate(),
        };

        let record = new_file.into_record(id);
        let position = records.next_position;
        records.next_position += 1;
        records.order.insert(position, id);
        records.files.insert(id, (position, record.clone()));

        Ok(record)
    }

    async fn finalize_record(
        &self,
        id: FileId,
        length: u64,
        checksum: Checksum,
    ) -> Result<FileRecord> {
        let mut records = self.records.write();
        let (_, record) = records
            .files
            .get_mut(&id)
            .ok_or(BucketError::NotFound(id))?;

        record.length = length;
        record.checksum = Some(checksum);
        record.complete = true;

        Ok(record.clone())
    }

    async fn get_record(&self, id: FileId) -> Result<FileRecord> {
        let records = self.records.read();
        records
            .files
            .get(&id)
            .map(|(_, record)| record.clone())
            .ok_or(BucketError::NotFound(id))
    }

    async fn delete_record(&self, id: FileId) -> Result<()> {
        let mut records = self.records.write();
        let (position, _) = records
            .files
            .remove(&id)
            .ok_or(BucketError::NotFound(id))?;
        records.order.remove(&position);

        Ok(())
    }

    fn list_records(&self) -> BoxStream<'_, Result<FileRecord>> {
        let ids: Vec<FileId> = self.records.read().order.values().copied().collect();

        Box::pin(async_stream::stream! {
            for id in ids {
                let record = self.records.read().files.get(&id).map(|(_, record)| record.clone());
                if let Some(record) = record {
                    yield Ok::<_, BucketError>(record);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use super::*;

    fn chunk(contents: &[u8]) -> StoredChunk {
        StoredChunk::encode(contents, Compression::None).unwrap()
    }

    fn new_file(filename: &str) -> NewFile {
        NewFile {
            id: None,
            filename: filename.into(),
            chunk_size: 4,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_chunks() {
        let store = MemStore::new();
        let file_id = FileId::generate();

        store.put_chunk(file_id, 0, chunk(b"abcd")).await.unwrap();
        store.put_chunk(file_id, 1, chunk(b"ef")).await.unwrap();
        assert_eq!(store.used_bytes(), 6);
        assert_eq!(store.count_chunks(file_id).await.unwrap(), 2);

        let read = store.get_chunk(file_id, 1).await.unwrap();
        assert_eq!(read.decode().unwrap(), b"ef");

        // chunks are never overwritten
        let err = store.put_chunk(file_id, 1, chunk(b"gh")).await.unwrap_err();
        assert_eq!(err.kind(), "DataError");

        let err = store.get_chunk(file_id, 2).await.unwrap_err();
        assert!(matches!(err, BucketError::ChunkNotFound { seq: 2, .. }));

        assert_eq!(store.delete_chunks(file_id).await.unwrap(), 2);
        assert_eq!(store.delete_chunks(file_id).await.unwrap(), 0);
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_capacity() {
        let store = MemStore::with_capacity(6);
        let file_id = FileId::generate();

        store.put_chunk(file_id, 0, chunk(b"abcd")).await.unwrap();
        let err = store.put_chunk(file_id, 1, chunk(b"efg")).await.unwrap_err();
        assert!(matches!(err, BucketError::StorageFull));

        store.delete_chunks(file_id).await.unwrap();
        store.put_chunk(file_id, 0, chunk(b"efg")).await.unwrap();
    }

    #[tokio::test]
    async fn test_records() {
        let store = MemStore::new();

        let record = store.create_record(new_file("a.txt")).await.unwrap();
        assert!(!record.complete);
        assert_eq!(record.length, 0);

        let checksum = Checksum::from(blake3::hash(b"hello"));
        let finalized = store.finalize_record(record.id, 5, checksum).await.unwrap();
        assert!(finalized.complete);
        assert_eq!(finalized.length, 5);
        assert_eq!(store.get_record(record.id).await.unwrap().checksum, Some(checksum));

        let mut taken = new_file("b.txt");
        taken.id = Some(record.id);
        let err = store.create_record(taken).await.unwrap_err();
        assert!(matches!(err, BucketError::AlreadyExists(_)));

        store.delete_record(record.id).await.unwrap();
        let err = store.delete_record(record.id).await.unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
        let err = store
            .finalize_record(record.id, 1, checksum)
            .await
            .unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_listing_order() {
        let store = MemStore::new();
        let mut ids = vec![];
        for name in ["a", "b", "c", "d"] {
            ids.push(store.create_record(new_file(name)).await.unwrap().id);
        }
        store.delete_record(ids[1]).await.unwrap();

        let listed: Vec<_> = store.list_records().try_collect().await.unwrap();
        let names: Vec<_> = listed.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, ["a", "c", "d"]);

        // every listing starts from scratch
        let again: Vec<_> = store.list_records().try_collect().await.unwrap();
        assert_eq!(again.len(), 3);
    }
}
