use serde::{Deserialize, Serialize};

pub mod fjall_impl;
pub mod mem_impl;

pub use chunk::{Compression, StoredChunk};
pub use file::{Checksum, FileId, FileRecord, Metadata, NewFile};

/// Longest filename accepted by the catalog, in bytes.
pub const MAX_FILENAME_LEN: usize = 1024;

pub mod chunk {
    use super::*;

    const ZSTD_LEVEL: i32 = 3;

    #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Compression {
        #[default]
        None = 0,
        Zstd = 1,
    }

    /// A chunk as it is persisted in a `ChunkStore`.
    ///
    /// `hash` is the BLAKE3 digest of the *uncompressed* contents, so it can be
    /// verified after decompression regardless of how the chunk was stored.
    #[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct StoredChunk {
        pub size: u32,
        pub compression: Compression,
        pub hash: [u8; 32],
        pub data: Vec<u8>,
    }

    impl StoredChunk {
        pub fn encode(contents: &[u8], compression: Compression) -> std::io::Result<Self> {
            let hash = *blake3::hash(contents).as_bytes();
            let size = contents.len() as u32;

            let (compression, data) = match compression {
                Compression::None => (Compression::None, contents.to_vec()),
                Compression::Zstd => {
                    let compressed = zstd::bulk::compress(contents, ZSTD_LEVEL)?;
                    // incompressible chunks are kept as-is
                    if compressed.len() < contents.len() {
                        (Compression::Zstd, compressed)
                    } else {
                        (Compression::None, contents.to_vec())
                    }
                }
            };

            Ok(Self {
                size,
                compression,
                hash,
                data,
            })
        }

        /// Number of bytes this chunk occupies in a store.
        pub fn stored_len(&self) -> usize {
            self.data.len()
        }

        /// Decompresses the chunk and checks it against its digest.
        ///
        /// Returns `None` if the payload does not decode to exactly `size` bytes
        /// hashing to `hash`.
        pub fn decode(self) -> Option<Vec<u8>> {
            let contents = match self.compression {
                Compression::None => self.data,
                Compression::Zstd => {
                    zstd::bulk::decompress(&self.data, self.size as usize).ok()?
                }
            };

            if contents.len() != self.size as usize || blake3::hash(&contents) != self.hash {
                return None;
            }
            Some(contents)
        }
    }
}

pub mod file {
    use core::str::FromStr;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::error::BucketError;

    /// Free-form user metadata attached to a file.
    pub type Metadata = serde_json::Map<String, serde_json::Value>;

    /// The opaque, randomly generated ID of a stored file.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct FileId(pub [u8; 16]);

    impl FileId {
        pub fn generate() -> Self {
            Self(uuid::Uuid::new_v4().into_bytes())
        }

        pub fn as_bytes(&self) -> &[u8; 16] {
            &self.0
        }
    }

    impl FromStr for FileId {
        type Err = BucketError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let invalid = || BucketError::Data(format!("invalid file id `{s}`"));
            if s.len() != 32 {
                return Err(invalid());
            }
            let mut bytes = [0; 16];
            base16ct::mixed::decode(s, &mut bytes).map_err(|_| invalid())?;
            Ok(Self(bytes))
        }
    }

    impl Serialize for FileId {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de> Deserialize<'de> for FileId {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }

    /// BLAKE3 digest over the full contents of a file.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Checksum(pub [u8; 32]);

    impl From<blake3::Hash> for Checksum {
        fn from(hash: blake3::Hash) -> Self {
            Self(*hash.as_bytes())
        }
    }

    impl Serialize for Checksum {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    /// Catalog entry describing one stored file.
    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FileRecord {
        pub id: FileId,
        pub filename: String,
        pub length: u64,
        pub chunk_size: u32,
        pub upload_date: DateTime<Utc>,
        pub metadata: Metadata,
        pub complete: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub checksum: Option<Checksum>,
    }

    impl FileRecord {
        /// The `contentType` the file was uploaded with, if any.
        pub fn content_type(&self) -> Option<&str> {
            self.metadata
                .get("contentType")
                .and_then(serde_json::Value::as_str)
        }

        /// Number of chunks a complete file of this length consists of.
        pub fn chunk_count(&self) -> u64 {
            self.length.div_ceil(self.chunk_size as u64)
        }

        /// The exact length of chunk `seq` of this (complete) file.
        pub fn chunk_len(&self, seq: u32) -> usize {
            let chunk_size = self.chunk_size as u64;
            let chunk_start = seq as u64 * chunk_size;
            self.length.saturating_sub(chunk_start).min(chunk_size) as usize
        }
    }

    /// Everything needed to create a new, incomplete `FileRecord`.
    #[derive(Debug, Clone)]
    pub struct NewFile {
        /// A caller-chosen ID, or `None` to have the catalog generate one.
        pub id: Option<FileId>,
        pub filename: String,
        pub chunk_size: u32,
        pub metadata: Metadata,
    }

    impl NewFile {
        pub fn validate(&self) -> Result<(), BucketError> {
            if self.filename.is_empty() {
                return Err(BucketError::Data("filename must not be empty".into()));
            }
            if self.filename.len() > MAX_FILENAME_LEN {
                return Err(BucketError::Data(format!(
                    "filename exceeds {MAX_FILENAME_LEN} bytes"
                )));
            }
            if self.filename.chars().any(char::is_control) {
                return Err(BucketError::Data(
                    "filename must not contain control characters".into(),
                ));
            }
            if self.chunk_size == 0 {
                return Err(BucketError::Data("chunk size must be positive".into()));
            }
            if let Some(key) = self
                .metadata
                .keys()
                .find(|key| key.is_empty() || key.contains('\0'))
            {
                return Err(BucketError::Data(format!("invalid metadata key {key:?}")));
            }
            Ok(())
        }

        pub fn into_record(self, id: FileId) -> FileRecord {
            FileRecord {
                id,
                filename: self.filename,
                length: 0,
                chunk_size: self.chunk_size,
                upload_date: Utc::now(),
                metadata: self.metadata,
                complete: false,
                checksum: None,
            }
        }
    }
}

mod dbg {
    use super::*;
    use core::fmt;

    impl fmt::Display for file::FileId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for file::FileId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "FileId({:x})", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Display for file::Checksum {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for file::Checksum {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Checksum(BLAKE3:{:x})", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for chunk::StoredChunk {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("StoredChunk")
                .field("size", &self.size)
                .field("compression", &self.compression)
                .field(
                    "hash",
                    &format_args!("BLAKE3:{:x}", base16ct::HexDisplay(&self.hash)),
                )
                .field("stored_len", &self.data.len())
                .finish()
        }
    }
}
