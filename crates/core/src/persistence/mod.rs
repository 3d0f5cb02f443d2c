//! Write-behind mirror of jobs and batches. The in-memory store stays the
//! source of truth; persistence is only read at startup.

mod handle;
mod memory;
mod sqlite;
mod store;
mod writer;

pub use handle::{PersistenceCommand, PersistenceHandle};
pub use memory::MemoryPersistence;
pub use sqlite::SqlitePersistence;
pub use store::{Persistence, PersistenceError};
pub use writer::{create_persistence_system, PersistenceWriter};
