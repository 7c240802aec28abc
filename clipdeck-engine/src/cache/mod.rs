//! Two-tier, quota-bounded sample cache

pub mod compression;
pub mod entry;
mod memory_tier;
pub mod persistent_cache;
pub mod sqlite;
pub mod store;

pub use entry::{CacheEntry, StoredSamples};
pub use persistent_cache::{CacheStats, PersistentCache};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, PersistedRecord, PersistentStore, RecordMeta};
