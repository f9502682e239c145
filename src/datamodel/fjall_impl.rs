use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use fjall::{
    PartitionCreateOptions, PersistMode, TransactionalKeyspace, TransactionalPartitionHandle,
};
use futures_util::stream::BoxStream;
use tempfile::TempDir;

use super::*;
use crate::catalog::FileCatalog;
use crate::chunkstore::ChunkStore;
use crate::error::{BucketError, Result};

/// `file_id ++ seq` (big endian), so that all chunks of a file share a prefix
/// and iterate in sequence order.
fn chunk_key(file_id: FileId, seq: u32) -> [u8; 20] {
    let mut key = [0; 20];
    key[..16].copy_from_slice(file_id.as_bytes());
    key[16..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// The on-disk form of a `FileRecord`.
///
/// `postcard` is not self-describing, so the free-form metadata is kept as a
/// JSON string.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    position: u64,
    filename: String,
    length: u64,
    chunk_size: u32,
    upload_date_ms: i64,
    metadata: String,
    complete: bool,
    checksum: Option<[u8; 32]>,
}

impl StoredRecord {
    fn new(position: u64, record: &FileRecord) -> Result<Self> {
        Ok(Self {
            position,
            filename: record.filename.clone(),
            length: record.length,
            chunk_size: record.chunk_size,
            upload_date_ms: record.upload_date.timestamp_millis(),
            metadata: serde_json::to_string(&record.metadata)?,
            complete: record.complete,
            checksum: record.checksum.map(|checksum| checksum.0),
        })
    }

    fn into_record(self, id: FileId) -> Result<FileRecord> {
        let upload_date = DateTime::<Utc>::from_timestamp_millis(self.upload_date_ms)
            .ok_or_else(|| BucketError::io(format!("invalid upload date of file {id}")))?;

        Ok(FileRecord {
            id,
            filename: self.filename,
            length: self.length,
            chunk_size: self.chunk_size,
            upload_date,
            metadata: serde_json::from_str(&self.metadata)?,
            complete: self.complete,
            checksum: self.checksum.map(Checksum),
        })
    }
}

/// A persistent store on top of a `fjall` keyspace.
///
/// Implements both `ChunkStore` and `FileCatalog`, using one partition each
/// for chunks and records, plus one mapping insertion positions to file IDs.
pub struct FjallStore {
    database: TransactionalKeyspace,
    chunks: TransactionalPartitionHandle,
    files: TransactionalPartitionHandle,
    file_order: TransactionalPartitionHandle,

    next_position: AtomicU64,

    /// Keeps a temporary keyspace alive for as long as the store.
    /// Declared last, so the directory outlives the keyspace.
    _tempdir: Option<TempDir>,
}

impl Drop for FjallStore {
    fn drop(&mut self) {
        if let Err(err) = self.database.persist(PersistMode::SyncAll) {
            tracing::warn!(error = %err, "failed to persist keyspace on shutdown");
        }
    }
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(path.as_ref(), None)
    }

    /// Opens a store in a fresh temporary directory, removed on drop.
    pub fn temporary() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let path = tempdir.path().to_path_buf();
        Self::open_inner(&path, Some(tempdir))
    }

    fn open_inner(path: &Path, tempdir: Option<TempDir>) -> Result<Self> {
        let database = fjall::Config::new(path).open_transactional()?;
        let chunks = database.open_partition("chunks", PartitionCreateOptions::default())?;
        let files = database.open_partition("files", PartitionCreateOptions::default())?;
        let file_order =
            database.open_partition("file_order", PartitionCreateOptions::default())?;

        let next_position = {
            let read_tx = database.read_tx();
            match read_tx.iter(&file_order).next_back() {
                Some(entry) => {
                    let (key, _) = entry?;
                    decode_position(&key)? + 1
                }
                None => 0,
            }
        };

        Ok(Self {
            database,
            chunks,
            files,
            file_order,
            next_position: AtomicU64::new(next_position),
            _tempdir: tempdir,
        })
    }

    fn read_stored_record(&self, id: FileId) -> Result<Option<StoredRecord>> {
        let read_tx = self.database.read_tx();
        let Some(value) = read_tx.get(&self.files, id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(postcard::from_bytes(&value)?))
    }

    /// A snapshot of all file IDs, in insertion order.
    fn ordered_ids(&self) -> Result<Vec<FileId>> {
        let read_tx = self.database.read_tx();
        let mut ids = vec![];
        for entry in read_tx.iter(&self.file_order) {
            let (_, value) = entry?;
            ids.push(decode_file_id(&value)?);
        }
        Ok(ids)
    }
}

/// Flattens the outcome of a committed transaction.
fn committed<C>(outcome: std::result::Result<(), C>) -> Result<()> {
    outcome.map_err(|_| BucketError::io("conflicting concurrent transaction"))
}

fn decode_position(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| BucketError::io("malformed file order key"))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_file_id(value: &[u8]) -> Result<FileId> {
    let bytes: [u8; 16] = value
        .try_into()
        .map_err(|_| BucketError::io("malformed file id"))?;
    Ok(FileId(bytes))
}

#[async_trait::async_trait]
impl ChunkStore for FjallStore {
    async fn put_chunk(&self, file_id: FileId, seq: u32, chunk: StoredChunk) -> Result<()> {
        let key = chunk_key(file_id, seq);
        let value = postcard::to_stdvec(&chunk)?;

        let mut write_tx = self.database.write_tx()?;
        if write_tx.contains_key(&self.chunks, key)? {
            return Err(BucketError::Data(format!(
                "chunk {seq} of file {file_id} was already written"
            )));
        }
        write_tx.insert(&self.chunks, key.as_slice(), value);
        committed(write_tx.commit()?)
    }

    async fn get_chunk(&self, file_id: FileId, seq: u32) -> Result<StoredChunk> {
        let read_tx = self.database.read_tx();
        let chunk = read_tx
            .get(&self.chunks, chunk_key(file_id, seq))?
            .ok_or(BucketError::ChunkNotFound { file_id, seq })?;

        Ok(postcard::from_bytes(&chunk)?)
    }

    async fn delete_chunks(&self, file_id: FileId) -> Result<u64> {
        let keys = {
            let read_tx = self.database.read_tx();
            read_tx
                .prefix(&self.chunks, file_id.as_bytes())
                .map(|entry| entry.map(|(key, _)| key))
                .collect::<Result<Vec<_>, _>>()?
        };
        if keys.is_empty() {
            return Ok(0);
        }

        let mut write_tx = self.database.write_tx()?;
        for key in &keys {
            write_tx.remove(&self.chunks, key.clone());
        }
        committed(write_tx.commit()?)?;

        Ok(keys.len() as u64)
    }

    async fn count_chunks(&self, file_id: FileId) -> Result<u64> {
        let read_tx = self.database.read_tx();
        let mut count = 0;
        for entry in read_tx.prefix(&self.chunks, file_id.as_bytes()) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait::async_trait]
impl FileCatalog for FjallStore {
    async fn create_record(&self, new_file: NewFile) -> Result<FileRecord> {
        new_file.validate()?;

        let id = new_file.id.unwrap_or_else(FileId::generate);
        let record = new_file.into_record(id);
        let position = self.next_position.fetch_add(1, Ordering::Relaxed);
        let stored = postcard::to_stdvec(&StoredRecord::new(position, &record)?)?;

        let mut write_tx = self.database.write_tx()?;
        if write_tx.contains_key(&self.files, id.as_bytes())? {
            return Err(BucketError::AlreadyExists(id));
        }
        write_tx.insert(&self.files, id.as_bytes().as_slice(), stored);
        write_tx.insert(
            &self.file_order,
            position.to_be_bytes().as_slice(),
            id.as_bytes().as_slice(),
        );
        committed(write_tx.commit()?)?;

        Ok(record)
    }

    async fn finalize_record(
        &self,
        id: FileId,
        length: u64,
        checksum: Checksum,
    ) -> Result<FileRecord> {
        let mut write_tx = self.database.write_tx()?;
        let value = write_tx
            .get(&self.files, id.as_bytes())?
            .ok_or(BucketError::NotFound(id))?;
        let mut stored: StoredRecord = postcard::from_bytes(&value)?;

        stored.length = length;
        stored.checksum = Some(checksum.0);
        stored.complete = true;

        let value = postcard::to_stdvec(&stored)?;
        write_tx.insert(&self.files, id.as_bytes().as_slice(), value);
        committed(write_tx.commit()?)?;
        // the journal is shared, so this also syncs all chunks of the file
        self.database.persist(PersistMode::SyncAll)?;

        stored.into_record(id)
    }

    async fn get_record(&self, id: FileId) -> Result<FileRecord> {
        self.read_stored_record(id)?
            .ok_or(BucketError::NotFound(id))?
            .into_record(id)
    }

    async fn delete_record(&self, id: FileId) -> Result<()> {
        let mut write_tx = self.database.write_tx()?;
        let value = write_tx
            .get(&self.files, id.as_bytes())?
            .ok_or(BucketError::NotFound(id))?;
        let stored: StoredRecord = postcard::from_bytes(&value)?;

        write_tx.remove(&self.files, id.as_bytes().as_slice());
        write_tx.remove(&self.file_order, stored.position.to_be_bytes().as_slice());
        committed(write_tx.commit()?)
    }

    fn list_records(&self) -> BoxStream<'_, Result<FileRecord>> {
        Box::pin(async_stream::stream! {
            let ids = match self.ordered_ids() {
                Ok(ids) => ids,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            for id in ids {
                match self.read_stored_record(id) {
                    Ok(Some(stored)) => yield stored.into_record(id),
                    // deleted since the listing started
                    Ok(None) => {}
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use super::*;

    fn new_file(filename: &str) -> NewFile {
        NewFile {
            id: None,
            filename: filename.into(),
            chunk_size: 16,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_chunks() {
        let store = FjallStore::temporary().unwrap();
        let file_id = FileId::generate();
        let other_id = FileId::generate();

        for (seq, contents) in [&b"chunked, and "[..], b"compressed"].into_iter().enumerate() {
            let chunk = StoredChunk::encode(contents, Compression::Zstd).unwrap();
            store.put_chunk(file_id, seq as u32, chunk).await.unwrap();
        }
        let chunk = StoredChunk::encode(b"other", Compression::None).unwrap();
        store.put_chunk(other_id, 0, chunk.clone()).await.unwrap();

        let err = store.put_chunk(other_id, 0, chunk).await.unwrap_err();
        assert_eq!(err.kind(), "DataError");

        let read = store.get_chunk(file_id, 1).await.unwrap();
        assert_eq!(read.decode().unwrap(), b"compressed");
        assert_eq!(store.count_chunks(file_id).await.unwrap(), 2);

        assert_eq!(store.delete_chunks(file_id).await.unwrap(), 2);
        assert_eq!(store.delete_chunks(file_id).await.unwrap(), 0);
        assert!(matches!(
            store.get_chunk(file_id, 0).await.unwrap_err(),
            BucketError::ChunkNotFound { .. }
        ));

        // chunks of other files are untouched
        assert_eq!(store.count_chunks(other_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_records() {
        let store = FjallStore::temporary().unwrap();

        let mut new = new_file("report.pdf");
        new.metadata
            .insert("contentType".into(), "application/pdf".into());
        new.metadata
            .insert("tags".into(), serde_json::json!({ "year": 2024, "draft": false }));
        let record = store.create_record(new.clone()).await.unwrap();

        let read = store.get_record(record.id).await.unwrap();
        assert!(!read.complete);
        assert_eq!(read.metadata, new.metadata);
        assert_eq!(
            read.upload_date.timestamp_millis(),
            record.upload_date.timestamp_millis()
        );

        let checksum = Checksum::from(blake3::hash(b"contents"));
        store.finalize_record(record.id, 8, checksum).await.unwrap();
        let read = store.get_record(record.id).await.unwrap();
        assert!(read.complete);
        assert_eq!(read.length, 8);
        assert_eq!(read.checksum, Some(checksum));

        new.id = Some(record.id);
        let err = store.create_record(new).await.unwrap_err();
        assert!(matches!(err, BucketError::AlreadyExists(_)));

        store.delete_record(record.id).await.unwrap();
        let err = store.get_record(record.id).await.unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
        let err = store.delete_record(record.id).await.unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_listing_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let ids = {
            let store = FjallStore::open(dir.path()).unwrap();
            let mut ids = vec![];
            for name in ["a", "b", "c"] {
                ids.push(store.create_record(new_file(name)).await.unwrap().id);
            }
            store.delete_record(ids[0]).await.unwrap();
            ids
        };

        let store = FjallStore::open(dir.path()).unwrap();
        store.create_record(new_file("d")).await.unwrap();

        let listed: Vec<_> = store.list_records().try_collect().await.unwrap();
        let names: Vec<_> = listed.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, ["b", "c", "d"]);
        assert_eq!(listed[0].id, ids[1]);
    }
}
