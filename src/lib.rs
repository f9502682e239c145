pub mod bucket;
pub mod catalog;
pub mod chunker;
pub mod chunkstore;
pub mod config;
pub mod datamodel;
pub mod error;
pub mod server;

pub use bucket::{Bucket, ReadHandle, ReadRange, Removal, WriteHandle};
pub use error::{BucketError, Result};
