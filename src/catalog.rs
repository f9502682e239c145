use std::sync::Arc;

use futures_util::stream::BoxStream;

use crate::datamodel::{Checksum, FileId, FileRecord, NewFile};
use crate::error::Result;

pub type Catalog = Arc<dyn FileCatalog>;

/// Stores one `FileRecord` per file and remembers the order they were created in.
#[async_trait::async_trait]
pub trait FileCatalog: Send + Sync {
    /// Inserts a new, incomplete record.
    ///
    /// A fresh ID is generated unless `new_file.id` is set, in which case an
    /// existing record with that ID fails with `AlreadyExists`.
    async fn create_record(&self, new_file: NewFile) -> Result<FileRecord>;

    /// Marks the record complete, setting its final `length` and `checksum`.
    async fn finalize_record(
        &self,
        id: FileId,
        length: u64,
        checksum: Checksum,
    ) -> Result<FileRecord>;

    async fn get_record(&self, id: FileId) -> Result<FileRecord>;

    async fn delete_record(&self, id: FileId) -> Result<()>;

    /// Lazily yields all records in insertion order.
    ///
    /// Every call starts over from the current catalog contents. Records
    /// deleted while the stream is being consumed are skipped.
    fn list_records(&self) -> BoxStream<'_, Result<FileRecord>>;
}
