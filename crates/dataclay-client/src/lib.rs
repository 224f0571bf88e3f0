//! dataClay Client - location resolution and call routing
//!
//! The client runtime is the thin counterpart of the backend: it resolves
//! object locations through the metadata service, keeps a pool of backend
//! connections fresh, serializes object graphs for make-persistent, and
//! routes attribute access and method calls to the owning backend,
//! revalidating stale location hints on redirection errors.

pub mod connection;
pub mod object;
pub mod pool;
pub mod runtime;

pub use connection::{BackendConnection, Connector, LocalBackendConnection, LocalConnector};
pub use object::ClientObject;
pub use pool::BackendPool;
pub use runtime::ClientRuntime;
