//! In-process key/value tables whose entries expire after an idle period.
//!
//! A [`CacheTable`] maps keys to [`CacheItem`]s holding a byte payload. Items
//! added with a non-zero lifespan are evicted by the table's sweeper thread once
//! they have not been read (or kept alive) for that long. Tables can load
//! missing values through a data loader and notify callbacks when items are
//! added, about to be deleted, or about to expire.

mod cache_item;
mod cache_table;
mod config;
mod errors;
mod registry;
mod timer_loop;

pub use cache_item::{CacheItem, CacheKey, ExpireCallback};
pub use cache_table::{CacheTable, DataLoader, ItemCallback, WeakCacheTable};
pub use config::TableConfig;
pub use errors::CacheError;
pub use registry::CacheRegistry;

/// Target of every log line emitted by this crate.
pub const LOG_TARGET: &str = "hourglass_cache";

pub mod prelude {
    pub use super::{
        CacheError, CacheItem, CacheKey, CacheRegistry, CacheTable, TableConfig, WeakCacheTable,
    };
}
