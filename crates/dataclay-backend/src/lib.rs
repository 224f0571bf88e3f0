//! dataClay Backend - object heap and data manager
//!
//! This crate implements the backend side of the object store: the
//! load/unload state machine with per-object locking, the memory-pressure
//! eviction policy, session-based reference tracking with two-strike
//! quarantine, and the runtime that composes them behind the operational
//! surface (make-persistent, active methods, attribute access, moves and
//! replicas).

pub mod data_manager;
pub mod lock_registry;
pub mod memory;
pub mod methods;
pub mod object;
pub mod runtime;
pub mod sessions;
pub mod storage;

pub use data_manager::DataManager;
pub use lock_registry::LockRegistry;
pub use memory::{MemoryGauge, SystemMemoryGauge};
pub use methods::MethodRegistry;
pub use object::{PersistentObject, SerializedObject};
pub use runtime::{BackendRuntime, ObjectReceiver};
pub use sessions::SessionReferenceTracker;
pub use storage::{DiskStorage, ObjectStorage};
