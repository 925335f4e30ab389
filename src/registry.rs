use dashmap::DashMap;

use crate::{CacheKey, CacheTable, config::TableConfig, errors::CacheError};

/// Hands out one [`CacheTable`] per name.
///
/// The first `open` of a name creates the table, later calls return handles to
/// that same table. The registry is an ordinary value: build it once in the
/// composing application and share it by reference or inside an `Arc`.
///
/// ### Example
/// ```rust
/// use hourglass_cache::{CacheError, CacheRegistry, TableConfig};
/// use std::time::Duration;
///
/// # fn main() -> Result<(), CacheError> {
/// let registry = CacheRegistry::<String>::new(TableConfig::default());
/// let a = registry.open("users")?;
/// let b = registry.open("users")?;
///
/// a.add("id".to_string(), "42", Duration::ZERO);
/// assert!(b.exists(&"id".to_string()));
/// assert!(a.ptr_eq(&b));
/// # Ok(())
/// # }
/// ```
pub struct CacheRegistry<K: CacheKey = String> {
    tables: DashMap<String, CacheTable<K>>,
    config: TableConfig,
}

impl<K: CacheKey> Default for CacheRegistry<K> {
    fn default() -> Self {
        Self::new(TableConfig::default())
    }
}

impl<K: CacheKey> CacheRegistry<K> {
    /// `config` applies to every table this registry creates.
    pub fn new(config: TableConfig) -> Self {
        Self {
            tables: DashMap::new(),
            config,
        }
    }

    /// Returns the table registered under `name`, creating it on first access.
    ///
    /// Concurrent first calls for one name create a single table.
    pub fn open(&self, name: &str) -> Result<CacheTable<K>, CacheError> {
        if let Some(table) = self.tables.get(name) {
            return Ok(table.value().clone());
        }
        let table = self
            .tables
            .entry(name.to_owned())
            .or_try_insert_with(|| CacheTable::new(name, self.config.clone()))?;
        Ok(table.value().clone())
    }

    /// Returns the table registered under `name` without creating it.
    pub fn get(&self, name: &str) -> Option<CacheTable<K>> {
        self.tables.get(name).map(|table| table.value().clone())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
