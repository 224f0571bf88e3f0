//! dataClay Metadata Store - kv-backed registry
//!
//! This crate implements the metadata service: a key-value registry of
//! accounts, datasets, sessions, backends, object metadata and aliases,
//! with atomic create-if-absent semantics.

pub mod api;
pub mod kv;
pub mod records;

pub use api::MetadataService;
pub use kv::{KvStore, MemoryKv, RedbKv};
pub use records::{
    Account, Alias, Backend, Dataclay, Dataset, KvRecord, ObjectMetadata, Session,
};
