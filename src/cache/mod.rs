//! Offline cache: named policies that route every outbound fetch, over one
//! persisted store shared with the sync coordinator.
//!
//! - `CacheFirst` policies serve valid entries without touching the network
//! - `NetworkFirst` policies prefer the network within a timeout and fall back
//!   to the cache (or the offline page for documents)
//! - Each policy evicts its own oldest entries beyond `max_entries`

mod policy;
mod router;
mod storage;
mod traits;

pub use policy::{cache_key, CachePolicy, PolicyTable, RequestMatcher, Strategy};
pub use router::{CacheRouter, DEFAULT_OFFLINE_PAGE};
pub use storage::{CacheStorage, SqliteStorage, StorageError, StorageResult, SyncState};
pub use traits::{CacheEntry, CacheResult, CacheSource};
