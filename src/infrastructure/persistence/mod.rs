//! Persistence backends and backend selection.

mod cleanup;
mod db_persistence;
mod file_index;
mod file_persistence;
mod key_locks;
mod slot;

use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::errors::PersistenceResult;
use crate::domain::ports::Persistence;

pub use cleanup::{CleanupPolicy, DELETE_BATCH};
pub use db_persistence::{DEFAULT_WRITER_THREADS, DbPersistence, SCHEMA_VERSION};
pub use file_index::{FileIndex, INDEX_FILE};
pub use file_persistence::{DEFAULT_MAX_FILE_COUNT, FilePersistence};
pub use key_locks::{KeyGuard, KeyLocks};
pub use slot::{DatabaseSlot, FileSlot, PersistenceSlot};

/// Builds the (uninitialized) backend described by `slot`.
///
/// # Errors
/// Returns an error if the slot names an invalid table.
pub fn build_backend(slot: &PersistenceSlot) -> PersistenceResult<Arc<dyn Persistence>> {
    Ok(match slot {
        PersistenceSlot::File(file) => Arc::new(FilePersistence::new(
            file.directory.clone(),
            file.max_file_count,
        )),
        PersistenceSlot::Database(db) => {
            let mut backend = DbPersistence::new(db.path.clone(), &db.table)?
                .with_cleanup(db.cleanup);
            if db.async_writes {
                backend = backend.with_async_writes(db.writer_threads);
            }
            Arc::new(backend)
        }
    })
}

/// Builds and initializes the backend of `slot`.
///
/// Corrupted storage is purged and initialized once more before giving up.
///
/// # Errors
/// Returns the initialization error, or the second one after a purge.
pub async fn open_backend(slot: &PersistenceSlot) -> PersistenceResult<Arc<dyn Persistence>> {
    let backend = build_backend(slot)?;
    match backend.initialize().await {
        Ok(()) => {}
        Err(e) if e.is_corruption() => {
            warn!(backend = backend.name(), error = %e, "Corrupted storage, purging");
            backend.purge().await?;
            backend.initialize().await?;
            info!(backend = backend.name(), "Storage re-initialized after purge");
        }
        Err(e) => return Err(e),
    }
    Ok(backend)
}
