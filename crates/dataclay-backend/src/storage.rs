//! Local object storage.
//!
//! One file per object under the configured storage path, named by object
//! id. The blob is whatever the data manager serialized; this layer only
//! moves bytes and maps filesystem failures into the storage error family.

use dataclay_common::{Error, ObjectId, Result};
use std::fs;
use std::path::PathBuf;

/// Byte-level storage for serialized object snapshots.
pub trait ObjectStorage: Send + Sync {
    /// Write (or overwrite) the snapshot for an object.
    fn store(&self, object_id: ObjectId, bytes: &[u8]) -> Result<()>;

    /// Read the snapshot, failing with `ObjectNotFound` if there is none.
    fn load(&self, object_id: ObjectId) -> Result<Vec<u8>>;

    /// Remove the snapshot (missing snapshots are not an error).
    fn delete(&self, object_id: ObjectId) -> Result<()>;
}

/// Filesystem-backed storage at `{root}/{object_id}`.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Open the storage directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::Internal(format!("cannot create storage path: {e}")))?;
        Ok(Self { root })
    }

    fn object_path(&self, object_id: ObjectId) -> PathBuf {
        self.root.join(object_id.to_string())
    }
}

impl ObjectStorage for DiskStorage {
    fn store(&self, object_id: ObjectId, bytes: &[u8]) -> Result<()> {
        fs::write(self.object_path(object_id), bytes)
            .map_err(|e| Error::object_storage(object_id, e.to_string()))
    }

    fn load(&self, object_id: ObjectId) -> Result<Vec<u8>> {
        match fs::read(self.object_path(object_id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(object_id))
            }
            Err(e) => Err(Error::object_storage(object_id, e.to_string())),
        }
    }

    fn delete(&self, object_id: ObjectId) -> Result<()> {
        match fs::remove_file(self.object_path(object_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::object_storage(object_id, e.to_string())),
        }
    }
}
