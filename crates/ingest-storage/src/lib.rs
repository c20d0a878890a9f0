//! Durable snapshot storage and job metadata persistence.

mod metadata;
mod object;

pub use metadata::{MemoryMetadataStore, MetadataError, MetadataStore, PgMetadataStore};
pub use object::{
    sha256_hex, LocalObjectStore, MemoryObject, MemoryObjectStore, ObjectStore, StorageError,
    StoredObject,
};

pub const CRATE_NAME: &str = "ingest-storage";
