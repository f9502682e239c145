use crate::datamodel::FileId;

pub type Result<T, E = BucketError> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    /// The file does not exist, or its upload has not completed yet.
    #[error("file {0} not found")]
    NotFound(FileId),
    #[error("chunk {seq} of file {file_id} not found")]
    ChunkNotFound { file_id: FileId, seq: u32 },
    #[error("file {0} is currently being uploaded")]
    Conflict(FileId),
    #[error("file {0} already exists")]
    AlreadyExists(FileId),
    #[error("chunk {seq} of file {file_id} is corrupted")]
    Corrupted { file_id: FileId, seq: u32 },
    #[error("storage is full")]
    StorageFull,
    /// Malformed input, rejected before any store was touched.
    #[error("{0}")]
    Data(String),
    #[error("storage error: {0}")]
    Io(#[source] BoxError),
}

impl BucketError {
    pub fn io(err: impl Into<BoxError>) -> Self {
        Self::Io(err.into())
    }

    /// The class of this error, as exposed to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::ChunkNotFound { .. } => "NotFound",
            Self::Conflict(_) | Self::AlreadyExists(_) => "Conflict",
            Self::Corrupted { .. } => "Corrupted",
            Self::StorageFull => "StorageFull",
            Self::Data(_) => "DataError",
            Self::Io(_) => "IOError",
        }
    }
}

impl From<std::io::Error> for BucketError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err)
    }
}

impl From<fjall::Error> for BucketError {
    fn from(err: fjall::Error) -> Self {
        Self::io(err)
    }
}

impl From<postcard::Error> for BucketError {
    fn from(err: postcard::Error) -> Self {
        Self::io(err)
    }
}

impl From<serde_json::Error> for BucketError {
    fn from(err: serde_json::Error) -> Self {
        Self::io(err)
    }
}
