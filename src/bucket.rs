use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;

use futures_util::future;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::AsyncRead;

use crate::catalog::Catalog;
use crate::chunker::chunk_stream;
use crate::chunkstore::ChunkStorage;
use crate::config::{BucketConfig, StorageConfig, MAX_CHUNK_SIZE};
use crate::datamodel::fjall_impl::FjallStore;
use crate::datamodel::mem_impl::MemStore;
use crate::datamodel::{Checksum, Compression, FileId, FileRecord, Metadata, NewFile, StoredChunk};
use crate::error::{BucketError, Result};

/// A byte range `[start, end)` of a file. An `end` of `0` means "until EOF".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReadRange {
    pub start: u64,
    pub end: u64,
}

impl ReadRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// The outcome of a successful `Bucket::remove_by_id`.
#[derive(Debug)]
pub struct Removal {
    pub id: FileId,
    /// Set when the record is gone but some of its chunks could not be removed.
    pub warning: Option<String>,
}

impl Removal {
    pub fn message(&self) -> String {
        format!("File {} is deleted", self.id)
    }
}

/// Chunked file storage on top of a `ChunkStore` and a `FileCatalog`.
///
/// Cloning is cheap, all clones share the same stores.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

struct BucketInner {
    chunks: ChunkStorage,
    catalog: Catalog,
    chunk_size: u32,
    compression: Compression,
    /// Files with an open `WriteHandle`.
    writers: Mutex<HashSet<FileId>>,
}

impl Bucket {
    /// Opens the stores described by `config`.
    ///
    /// Uploads that never completed, for example because the process crashed,
    /// are purged before the bucket is returned.
    pub async fn open(config: BucketConfig) -> Result<Self> {
        let bucket = match &config.storage {
            StorageConfig::Memory { capacity } => {
                let store = Arc::new(match capacity {
                    Some(capacity) => MemStore::with_capacity(*capacity),
                    None => MemStore::new(),
                });
                Self::with_stores(store.clone(), store, &config)?
            }
            StorageConfig::Fjall { path } => {
                let store = Arc::new(match path {
                    Some(path) => FjallStore::open(path)?,
                    None => FjallStore::temporary()?,
                });
                Self::with_stores(store.clone(), store, &config)?
            }
        };

        let purged = bucket.purge_incomplete().await?;
        if purged > 0 {
            tracing::info!(purged, "purged incomplete uploads");
        }
        Ok(bucket)
    }

    pub fn with_stores(chunks: ChunkStorage, catalog: Catalog, config: &BucketConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.chunk_size > MAX_CHUNK_SIZE {
            return Err(BucketError::Data(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }

        Ok(Self {
            inner: Arc::new(BucketInner {
                chunks,
                catalog,
                chunk_size: config.chunk_size,
                compression: config.compression,
                writers: Default::default(),
            }),
        })
    }

    pub fn chunk_size(&self) -> u32 {
        self.inner.chunk_size
    }

    /// Starts uploading a new file under a freshly generated ID.
    pub async fn open_write(
        &self,
        filename: impl Into<String>,
        metadata: Metadata,
    ) -> Result<WriteHandle> {
        self.start_write(None, filename.into(), metadata).await
    }

    /// Starts uploading a new file under `id`.
    ///
    /// Fails with `Conflict` while another upload to `id` is in progress, and
    /// with `AlreadyExists` if a file with that ID is already stored.
    pub async fn open_write_with_id(
        &self,
        id: FileId,
        filename: impl Into<String>,
        metadata: Metadata,
    ) -> Result<WriteHandle> {
        self.start_write(Some(id), filename.into(), metadata).await
    }

    async fn start_write(
        &self,
        id: Option<FileId>,
        filename: String,
        metadata: Metadata,
    ) -> Result<WriteHandle> {
        let id = id.unwrap_or_else(FileId::generate);
        let new_file = NewFile {
            id: Some(id),
            filename,
            chunk_size: self.inner.chunk_size,
            metadata,
        };
        new_file.validate()?;

        // registered before the record exists, so it is never purged as stale
        let guard = WriterGuard::acquire(&self.inner, id)?;
        let record = self.inner.catalog.create_record(new_file).await?;

        tracing::debug!(file_id = %record.id, filename = %record.filename, "started upload");
        Ok(WriteHandle {
            bucket: self.clone(),
            buffer: Vec::with_capacity(record.chunk_size as usize),
            record,
            next_seq: 0,
            length: 0,
            hasher: blake3::Hasher::new(),
            guard: Some(guard),
        })
    }

    /// Uploads everything `reader` produces as a new file.
    pub async fn upload(
        &self,
        filename: impl Into<String>,
        metadata: Metadata,
        reader: impl AsyncRead + Unpin,
    ) -> Result<FileRecord> {
        let mut handle = self.open_write(filename, metadata).await?;
        handle.copy_from(reader).await?;
        handle.close().await
    }

    /// Opens `range` of a complete file for reading.
    pub async fn open_read(&self, id: FileId, range: ReadRange) -> Result<ReadHandle> {
        if range.end != 0 && range.end < range.start {
            return Err(BucketError::Data(format!(
                "range end {} is before its start {}",
                range.end, range.start
            )));
        }

        let record = self.find(id).await?;
        let end = match range.end {
            0 => record.length,
            end => end.min(record.length),
        };
        let start = range.start.min(end);

        Ok(ReadHandle {
            chunks: Arc::clone(&self.inner.chunks),
            next_seq: (start / record.chunk_size as u64) as u32,
            position: start,
            start,
            end,
            record,
        })
    }

    /// Looks up the record of a complete file.
    pub async fn find(&self, id: FileId) -> Result<FileRecord> {
        let record = self.inner.catalog.get_record(id).await?;
        if !record.complete {
            return Err(BucketError::NotFound(id));
        }
        Ok(record)
    }

    /// Removes a file and all of its chunks.
    ///
    /// The record is removed first. If removing the chunks fails afterwards,
    /// the file still counts as deleted and the failure is reported as
    /// `Removal::warning`.
    pub async fn remove_by_id(&self, id: FileId) -> Result<Removal> {
        if self.inner.writers.lock().contains(&id) {
            return Err(BucketError::Conflict(id));
        }

        if let Err(err) = self.inner.catalog.delete_record(id).await {
            if matches!(err, BucketError::NotFound(_)) {
                // reclaim whatever an earlier partial deletion left behind
                match self.inner.chunks.delete_chunks(id).await {
                    Ok(0) => {}
                    Ok(chunks) => tracing::info!(file_id = %id, chunks, "reclaimed orphaned chunks"),
                    Err(err) => {
                        tracing::warn!(file_id = %id, error = %err, "failed to reclaim orphaned chunks")
                    }
                }
            }
            return Err(err);
        }

        let warning = match self.inner.chunks.delete_chunks(id).await {
            Ok(chunks) => {
                tracing::info!(file_id = %id, chunks, "deleted file");
                None
            }
            Err(err) => {
                tracing::warn!(file_id = %id, error = %err, "deleted file, but not all of its chunks");
                Some(format!("chunks of file {id} could not be deleted: {err}"))
            }
        };

        Ok(Removal { id, warning })
    }

    /// Lists all complete files in the order they were created.
    pub fn list(&self) -> BoxStream<'_, Result<FileRecord>> {
        self.inner
            .catalog
            .list_records()
            .try_filter(|record| future::ready(record.complete))
            .boxed()
    }

    /// Removes all incomplete files that have no upload in progress.
    pub async fn purge_incomplete(&self) -> Result<u64> {
        let stale: Vec<FileId> = self
            .inner
            .catalog
            .list_records()
            .try_filter_map(|record| {
                future::ready(Ok((!record.complete).then_some(record.id)))
            })
            .try_collect()
            .await?;

        let mut purged = 0;
        for id in stale {
            if self.inner.writers.lock().contains(&id) {
                continue;
            }
            purge(&self.inner, id).await?;
            purged += 1;
        }
        Ok(purged)
    }
}

/// Removes all chunks and the record of `file_id`, tolerating either being absent.
async fn purge(inner: &BucketInner, file_id: FileId) -> Result<()> {
    let chunks = inner.chunks.delete_chunks(file_id).await;
    let record = match inner.catalog.delete_record(file_id).await {
        Err(BucketError::NotFound(_)) => Ok(()),
        result => result,
    };

    match (chunks, record) {
        (Ok(chunks), Ok(())) => {
            tracing::debug!(file_id = %file_id, chunks, "purged upload");
            Ok(())
        }
        (Err(err), _) | (_, Err(err)) => {
            tracing::warn!(file_id = %file_id, error = %err, "failed to purge upload");
            Err(err)
        }
    }
}

/// Registers a file as being written, until dropped.
struct WriterGuard {
    inner: Arc<BucketInner>,
    file_id: FileId,
}

impl WriterGuard {
    fn acquire(inner: &Arc<BucketInner>, file_id: FileId) -> Result<Self> {
        if !inner.writers.lock().insert(file_id) {
            return Err(BucketError::Conflict(file_id));
        }
        Ok(Self {
            inner: Arc::clone(inner),
            file_id,
        })
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.inner.writers.lock().remove(&self.file_id);
    }
}

/// An upload in progress.
///
/// Bytes are buffered until a full chunk is available, which is then stored
/// right away. The file becomes readable once `close` succeeds. Any failure,
/// an explicit `abort`, or dropping the handle removes everything written so far.
pub struct WriteHandle {
    bucket: Bucket,
    record: FileRecord,
    buffer: Vec<u8>,
    next_seq: u32,
    length: u64,
    hasher: blake3::Hasher,
    /// `Some` for as long as the upload is in progress.
    guard: Option<WriterGuard>,
}

impl WriteHandle {
    pub fn id(&self) -> FileId {
        self.record.id
    }

    /// Number of bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.length
    }

    fn ensure_uploading(&self) -> Result<()> {
        match self.guard {
            Some(_) => Ok(()),
            None => Err(BucketError::NotFound(self.record.id)),
        }
    }

    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        self.ensure_uploading()?;

        let chunk_size = self.record.chunk_size as usize;
        while !data.is_empty() {
            let take = (chunk_size - self.buffer.len()).min(data.len());
            let (head, tail) = data.split_at(take);
            self.buffer.extend_from_slice(head);
            self.hasher.update(head);
            self.length += head.len() as u64;
            data = tail;

            if self.buffer.len() == chunk_size {
                if let Err(err) = self.flush_chunk().await {
                    self.fail().await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Writes everything `reader` produces, returning the number of bytes copied.
    pub async fn copy_from(&mut self, reader: impl AsyncRead + Unpin) -> Result<u64> {
        self.ensure_uploading()?;

        let mut chunks = pin!(chunk_stream(self.record.chunk_size, reader));
        let mut copied = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.fail().await;
                    return Err(err.into());
                }
            };
            self.write(&chunk).await?;
            copied += chunk.len() as u64;
        }
        Ok(copied)
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        let seq = self.next_seq;
        let next_seq = seq
            .checked_add(1)
            .ok_or_else(|| BucketError::Data("file has too many chunks".into()))?;

        let data = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.record.chunk_size as usize),
        );
        let chunk = StoredChunk::encode(&data, self.bucket.inner.compression)?;
        let stored_len = chunk.stored_len();
        self.bucket
            .inner
            .chunks
            .put_chunk(self.record.id, seq, chunk)
            .await?;
        self.next_seq = next_seq;

        tracing::debug!(file_id = %self.record.id, seq, len = data.len(), stored_len, "stored chunk");
        Ok(())
    }

    /// Stores the last partial chunk and marks the file complete.
    pub async fn close(mut self) -> Result<FileRecord> {
        self.ensure_uploading()?;

        if !self.buffer.is_empty() {
            if let Err(err) = self.flush_chunk().await {
                self.fail().await;
                return Err(err);
            }
        }

        let checksum = Checksum::from(self.hasher.finalize());
        let finalized = self
            .bucket
            .inner
            .catalog
            .finalize_record(self.record.id, self.length, checksum)
            .await;
        match finalized {
            Ok(record) => {
                self.guard.take();
                tracing::info!(
                    file_id = %record.id,
                    filename = %record.filename,
                    length = record.length,
                    chunks = self.next_seq,
                    "finished upload"
                );
                Ok(record)
            }
            Err(err) => {
                self.fail().await;
                Err(err)
            }
        }
    }

    /// Cancels the upload, removing everything written so far before returning.
    pub async fn abort(mut self) -> Result<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        tracing::info!(file_id = %self.record.id, written = self.length, "aborting upload");
        let result = purge(&self.bucket.inner, self.record.id).await;
        drop(guard);
        result
    }

    /// Purges the upload after a failure. Best effort, the handle is unusable afterwards.
    async fn fail(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.buffer = Vec::new();
            let _ = purge(&self.bucket.inner, self.record.id).await;
            drop(guard);
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let file_id = self.record.id;
        let inner = Arc::clone(&self.bucket.inner);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(file_id = %file_id, "upload dropped before completion, purging");
                runtime.spawn(async move {
                    let _ = purge(&inner, file_id).await;
                    drop(guard);
                });
            }
            Err(_) => {
                tracing::warn!(file_id = %file_id, "upload dropped outside of a runtime, leaving it incomplete");
            }
        }
    }
}

/// A range of a complete file being read, one chunk at a time.
pub struct ReadHandle {
    chunks: ChunkStorage,
    record: FileRecord,
    start: u64,
    end: u64,
    next_seq: u32,
    /// Offset of the next byte to be returned.
    position: u64,
}

impl ReadHandle {
    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    /// Total number of bytes in the (clamped) range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the next piece of the range, or `None` once it is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.position >= self.end {
            return Ok(None);
        }

        let file_id = self.record.id;
        let seq = self.next_seq;
        let chunk = self.chunks.get_chunk(file_id, seq).await?;
        let data = chunk
            .decode()
            .filter(|data| data.len() == self.record.chunk_len(seq))
            .ok_or(BucketError::Corrupted { file_id, seq })?;

        let chunk_start = seq as u64 * self.record.chunk_size as u64;
        let from = (self.position - chunk_start) as usize;
        let to = (self.end - chunk_start).min(data.len() as u64) as usize;
        self.position = chunk_start + to as u64;
        self.next_seq += 1;

        if from == 0 && to == data.len() {
            Ok(Some(data))
        } else {
            Ok(Some(data[from..to].to_vec()))
        }
    }

    /// Turns the handle into a stream of buffers, ending after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        stream::try_unfold(self, |mut handle| async move {
            Ok(handle.next_chunk().await?.map(|chunk| (chunk, handle)))
        })
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut contents = Vec::with_capacity(self.len() as usize);
        while let Some(chunk) = self.next_chunk().await? {
            contents.extend_from_slice(&chunk);
        }
        Ok(contents)
    }
}
