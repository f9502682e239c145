use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::datamodel::Compression;

/// The default chunk size, 255 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 255 * 1024;

/// The largest accepted chunk size, 16 MiB. Uploads buffer one full chunk.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Keep everything in memory, optionally bounded to `capacity` chunk bytes.
    Memory { capacity: Option<u64> },
    /// Persist into a `fjall` keyspace at `path`, or a temporary directory.
    Fjall { path: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub chunk_size: u32,
    pub compression: Compression,
    pub storage: StorageConfig,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: Compression::None,
            storage: StorageConfig::Memory { capacity: None },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub bucket: BucketConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `GRIDBUCKET_*` variables provided by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("GRIDBUCKET_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into())
            .parse()
            .context("invalid GRIDBUCKET_ADDR")?;

        let chunk_size = match lookup("GRIDBUCKET_CHUNK_SIZE") {
            Some(value) => value.parse().context("invalid GRIDBUCKET_CHUNK_SIZE")?,
            None => DEFAULT_CHUNK_SIZE,
        };
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            bail!("GRIDBUCKET_CHUNK_SIZE must be between 1 and {MAX_CHUNK_SIZE}");
        }

        let compression = match lookup("GRIDBUCKET_COMPRESSION").as_deref() {
            None | Some("none") => Compression::None,
            Some("zstd") => Compression::Zstd,
            Some(other) => bail!("unknown GRIDBUCKET_COMPRESSION `{other}`"),
        };

        let capacity = lookup("GRIDBUCKET_CAPACITY")
            .map(|value| value.parse())
            .transpose()
            .context("invalid GRIDBUCKET_CAPACITY")?;

        let storage = match lookup("GRIDBUCKET_STORAGE").as_deref() {
            None | Some("fjall") => {
                if capacity.is_some() {
                    bail!("GRIDBUCKET_CAPACITY is only supported with GRIDBUCKET_STORAGE=memory");
                }
                StorageConfig::Fjall {
                    path: lookup("GRIDBUCKET_DATA_DIR").map(PathBuf::from),
                }
            }
            Some("memory") => StorageConfig::Memory { capacity },
            Some(other) => bail!("unknown GRIDBUCKET_STORAGE `{other}`"),
        };

        Ok(Self {
            listen_addr,
            bucket: BucketConfig {
                chunk_size,
                compression,
                storage,
            },
        })
    }
}
