pub use callbacks::{DataLoader, ItemCallback};
pub use main_type::{CacheTable, WeakCacheTable};

mod main_type {
    use std::{
        any::Any,
        collections::HashMap,
        sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
        time::Instant,
    };

    use bytes::Bytes;
    use crossbeam_channel::Sender;
    use log::{Level, Log};

    use crate::{
        CacheItem, CacheKey, ExpireCallback, config::TableConfig, errors::CacheError,
        timer_loop::TimerLoop,
    };

    use super::{
        callbacks::{DataLoader, ItemCallback},
        sweep,
        table_state::TableState,
    };

    /// Items removed by one sweep pass, with the expire callbacks to fire for each.
    pub(crate) type Evicted<K> = Vec<(Arc<CacheItem<K>>, Vec<ExpireCallback<K>>)>;

    pub(crate) struct Shared<K: CacheKey> {
        name: String,
        config: TableConfig,
        state: RwLock<TableState<K>>,
        wake: Sender<()>,
    }

    /// A named, thread-safe collection of [`CacheItem`]s that expire after an idle period.
    ///
    /// `CacheTable` is a cheap handle: clones share the same entries, callbacks and
    /// sweeper. Each table owns one background sweeper thread that sleeps until the
    /// earliest item deadline, evicts every item idle for at least its lifespan,
    /// then re-arms itself. The thread stops once every handle has been dropped.
    ///
    /// Callbacks are dispatched after the table lock is released, so handlers may
    /// call back into the table. Within one event they run in registration order.
    /// A loader or callback stored in the table that owns a `CacheTable` handle
    /// keeps the table, and its sweeper thread, alive forever. Capture a
    /// [`WeakCacheTable`] from [`downgrade`](Self::downgrade) instead.
    ///
    /// ### Example
    /// ```rust
    /// use hourglass_cache::{CacheError, CacheTable, TableConfig};
    /// use std::time::Duration;
    ///
    /// # fn main() -> Result<(), CacheError> {
    /// let table = CacheTable::<String>::new("sessions", TableConfig::default())?;
    /// table.add("alice".to_string(), "token", Duration::from_secs(30));
    ///
    /// assert_eq!(&table.value(&"alice".to_string())?[..], b"token");
    /// assert!(matches!(table.value(&"bob".to_string()), Err(CacheError::NotFound)));
    /// # Ok(())
    /// # }
    /// ```
    pub struct CacheTable<K: CacheKey = String> {
        shared: Arc<Shared<K>>,
    }

    impl<K: CacheKey> Clone for CacheTable<K> {
        fn clone(&self) -> Self {
            Self {
                shared: self.shared.clone(),
            }
        }
    }

    /// Non-owning handle to a [`CacheTable`], for loaders and callbacks that
    /// need to reach the table they are registered on.
    ///
    /// ### Example
    /// ```rust
    /// use hourglass_cache::{CacheItem, CacheTable, TableConfig};
    /// use std::time::Duration;
    ///
    /// let table = CacheTable::<String>::new("users", TableConfig::default()).unwrap();
    /// let weak = table.downgrade();
    /// table.set_data_loader(move |key: &String, _| {
    ///     let table = weak.upgrade()?;
    ///     table.add(format!("{}_seen", key), "", Duration::ZERO);
    ///     Some(CacheItem::new(key.clone(), "loaded", Duration::ZERO))
    /// });
    /// assert!(table.value(&"id".to_string()).is_ok());
    /// assert!(table.exists(&"id_seen".to_string()));
    /// ```
    pub struct WeakCacheTable<K: CacheKey = String> {
        shared: Weak<Shared<K>>,
    }

    impl<K: CacheKey> Clone for WeakCacheTable<K> {
        fn clone(&self) -> Self {
            Self {
                shared: self.shared.clone(),
            }
        }
    }

    impl<K: CacheKey> WeakCacheTable<K> {
        /// Returns a table handle, or `None` once every handle has been dropped.
        pub fn upgrade(&self) -> Option<CacheTable<K>> {
            self.shared.upgrade().map(|shared| CacheTable { shared })
        }
    }

    impl<K: CacheKey> CacheTable<K> {
        /// Creates an empty table and spawns its sweeper thread.
        ///
        /// Fails with [`CacheError::Io`] if the thread cannot be spawned.
        pub fn new(name: impl Into<String>, config: TableConfig) -> Result<Self, CacheError> {
            let name = name.into();
            let (wake, wake_rx) = crossbeam_channel::bounded(1);
            // thread names cannot hold NUL bytes, table names can
            let thread_name = format!("{}-{}", config.get_thread_name_prefix(), name)
                .replace('\0', "");
            let table = Self {
                shared: Arc::new(Shared {
                    name,
                    config,
                    state: RwLock::new(TableState::new()),
                    wake,
                }),
            };
            TimerLoop::run(&table, wake_rx, thread_name)?;
            log::debug!(target: crate::LOG_TARGET, "Created cache table [{}]", table.name());
            Ok(table)
        }

        pub fn name(&self) -> &str {
            &self.shared.name
        }

        /// Returns `true` if both handles point to the same table.
        pub fn ptr_eq(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.shared, &other.shared)
        }

        pub fn count(&self) -> usize {
            self.read().items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.read().items.is_empty()
        }

        /// Visits every item while holding the table's shared lock.
        ///
        /// `visit` must not call back into this table's mutating operations.
        pub fn foreach(&self, mut visit: impl FnMut(&K, &Arc<CacheItem<K>>)) {
            let state = self.read();
            for (key, item) in state.items.iter() {
                visit(key, item);
            }
        }

        /// Installs the loader invoked when `value` misses.
        ///
        /// A loader that needs this table should capture a [`WeakCacheTable`]:
        /// an owned handle makes a cycle that is never freed.
        pub fn set_data_loader(
            &self,
            f: impl Fn(&K, &[&str]) -> Option<CacheItem<K>> + Send + Sync + 'static,
        ) {
            self.write().loader = Some(Arc::new(f) as DataLoader<K>);
        }

        /// Routes this table's diagnostic lines to `logger` instead of the global
        /// `log` facade.
        pub fn set_logger(&self, logger: Arc<dyn Log>) {
            self.write().logger = Some(logger);
        }

        /// Replaces every added-item callback with `f`.
        ///
        /// As for the loader, a callback reaching this table should go through a
        /// [`WeakCacheTable`].
        pub fn set_added_item_callback(
            &self,
            f: impl Fn(&Arc<CacheItem<K>>) + Send + Sync + 'static,
        ) {
            let mut state = self.write();
            state.added_item.clear();
            state.added_item.push(Arc::new(f));
        }

        /// Appends `f` after the already registered added-item callbacks.
        pub fn add_added_item_callback(
            &self,
            f: impl Fn(&Arc<CacheItem<K>>) + Send + Sync + 'static,
        ) {
            self.write().added_item.push(Arc::new(f));
        }

        pub fn remove_added_item_callbacks(&self) {
            self.write().added_item.clear();
        }

        /// Replaces every about-to-delete callback with `f`.
        ///
        /// A callback reaching this table should go through a [`WeakCacheTable`].
        pub fn set_about_to_delete_item_callback(
            &self,
            f: impl Fn(&Arc<CacheItem<K>>) + Send + Sync + 'static,
        ) {
            let mut state = self.write();
            state.about_to_delete_item.clear();
            state.about_to_delete_item.push(Arc::new(f));
        }

        /// Appends `f` after the already registered about-to-delete callbacks.
        pub fn add_about_to_delete_item_callback(
            &self,
            f: impl Fn(&Arc<CacheItem<K>>) + Send + Sync + 'static,
        ) {
            self.write().about_to_delete_item.push(Arc::new(f));
        }

        pub fn remove_about_to_delete_item_callbacks(&self) {
            self.write().about_to_delete_item.clear();
        }

        /// Inserts a new item, replacing any item stored under the same key.
        ///
        /// A replaced item is dropped silently: no about-to-delete callback fires
        /// for it. Added-item callbacks fire with the new item.
        /// A zero `life_span` means the item never expires.
        pub fn add(
            &self,
            key: K,
            data: impl Into<Bytes>,
            life_span: std::time::Duration,
        ) -> Arc<CacheItem<K>> {
            self.insert(Arc::new(CacheItem::new(key, data, life_span)))
        }

        /// Inserts a new item only if `key` is absent. The check and the insert
        /// happen in one critical section.
        pub fn not_found_add(
            &self,
            key: K,
            data: impl Into<Bytes>,
            life_span: std::time::Duration,
        ) -> bool {
            let (item, callbacks) = {
                let mut state = self.write();
                if state.items.contains_key(&key) {
                    return false;
                }
                let item = Arc::new(CacheItem::new(key, data, life_span));
                self.insert_locked(&mut state, Arc::clone(&item));
                (item, state.added_item.clone())
            };
            for callback in &callbacks {
                callback(&item);
            }
            true
        }

        /// Returns the payload stored under `key`, refreshing its idle window.
        ///
        /// On a miss the data loader, if any, is asked for the item. The loader
        /// runs without any table lock held and may itself add to this table.
        pub fn value(&self, key: &K) -> Result<Bytes, CacheError> {
            self.value_with(key, &[])
        }

        /// Same as [`value`](Self::value), forwarding `args` to the data loader.
        pub fn value_with(&self, key: &K, args: &[&str]) -> Result<Bytes, CacheError> {
            let loader = {
                let state = self.read();
                if let Some(item) = state.items.get(key) {
                    item.keep_alive();
                    return Ok(item.data().clone());
                }
                state.log(
                    Level::Trace,
                    format_args!("Cache miss for key {:?} in table {}", key, self.name()),
                );
                state.loader.clone()
            };

            let loaded = loader.and_then(|loader| loader(key, args));
            match loaded {
                Some(item) => {
                    let item = self.insert(Arc::new(item.with_key(key.clone())));
                    Ok(item.data().clone())
                }
                None => Err(CacheError::NotFound),
            }
        }

        /// Membership test. Does not refresh the item nor call the loader.
        pub fn exists(&self, key: &K) -> bool {
            self.read().items.contains_key(key)
        }

        /// Removes the item stored under `key` and fires the about-to-delete
        /// callbacks with it. Fails with [`CacheError::NotFound`] if it is absent,
        /// including when the sweeper evicted it first.
        pub fn delete(&self, key: &K) -> Result<Arc<CacheItem<K>>, CacheError> {
            let (item, callbacks) = {
                let mut state = self.write();
                let item = state.items.remove(key).ok_or(CacheError::NotFound)?;
                state.log(
                    Level::Debug,
                    format_args!(
                        "Deleting item with key {:?} created {:?} ago from table {}",
                        key,
                        item.created_on().elapsed(),
                        self.name()
                    ),
                );
                (item, state.about_to_delete_item.clone())
            };
            for callback in &callbacks {
                callback(&item);
            }
            Ok(item)
        }

        /// Drops every item and disarms the sweeper. No callback fires.
        /// The table stays usable.
        pub fn flush(&self) {
            let mut state = self.write();
            state.log(Level::Info, format_args!("Flushing table {}", self.name()));
            state.items = HashMap::new();
            state.cleanup_at = None;
            state.flushes += 1;
            self.wake_sweeper();
        }

        /// Runs one eviction pass and re-arms the sweeper.
        ///
        /// Candidates are found on a snapshot without holding the table lock, then
        /// confirmed and removed under the write lock. Their expire callbacks, then
        /// the about-to-delete callbacks, fire once the lock is released.
        pub(crate) fn expiration_check(&self) {
            let now = Instant::now();
            let (snapshot, flushes) = self.begin_sweep();
            let threshold = self.shared.config.get_parallel_scan_threshold();
            let (expired, next) = sweep::scan(&snapshot, now, threshold);
            let (evicted, on_delete) = self.finish_sweep(flushes, expired, next, now);

            for (item, on_expire) in &evicted {
                for callback in on_expire {
                    callback(item.key());
                }
                for callback in &on_delete {
                    callback(item);
                }
            }
        }

        /// Disarms the sweeper and snapshots the expiring items, along with the
        /// flush count the snapshot was taken at.
        pub(crate) fn begin_sweep(&self) -> (Vec<Arc<CacheItem<K>>>, u64) {
            let mut state = self.write();
            state.log(
                Level::Trace,
                format_args!("Expiration check triggered for table {}", self.name()),
            );
            // inserts racing with the scan see an idle sweeper and re-arm it
            state.cleanup_at = None;
            (state.expiring_items(), state.flushes)
        }

        /// Evicts the `expired` candidates still stored and idle, then re-arms the
        /// sweeper. `next` is dropped if the table was flushed since the snapshot.
        pub(crate) fn finish_sweep(
            &self,
            flushes: u64,
            expired: Vec<Arc<CacheItem<K>>>,
            mut next: Option<Instant>,
            now: Instant,
        ) -> (Evicted<K>, Vec<ItemCallback<K>>) {
            let mut state = self.write();
            if state.flushes != flushes {
                next = None;
            }
            let mut evicted = Vec::new();
            for item in expired {
                let key = item.key();
                let still_stored = state
                    .items
                    .get(key)
                    .is_some_and(|stored| Arc::ptr_eq(stored, &item));
                if !still_stored {
                    continue;
                }
                match item.expire_with(now, || {
                    state.items.remove(key);
                }) {
                    Some(on_expire) => {
                        state.log(
                            Level::Debug,
                            format_args!(
                                "Evicting item with key {:?} idle for {:?} from table {}",
                                key,
                                now.saturating_duration_since(item.accessed_on()),
                                self.name()
                            ),
                        );
                        evicted.push((Arc::clone(&item), on_expire));
                    }
                    // kept alive since the scan
                    None => next = next.into_iter().chain(item.deadline()).min(),
                }
            }

            state.cleanup_at = state.cleanup_at.into_iter().chain(next).min();
            match state.cleanup_at {
                Some(at) => state.log(
                    Level::Trace,
                    format_args!(
                        "Next expiration check for table {} in {:?}",
                        self.name(),
                        at.saturating_duration_since(now)
                    ),
                ),
                None => state.log(
                    Level::Trace,
                    format_args!("No expiring item left in table {}, sweeper idle", self.name()),
                ),
            }
            (evicted, state.about_to_delete_item.clone())
        }

        /// Logs a panic raised by a callback during an expiration check. Items
        /// evicted by that pass stay evicted, their remaining callbacks are skipped.
        pub(crate) fn report_sweep_panic(&self, payload: &(dyn Any + Send)) {
            let reason = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            self.read().log(
                Level::Error,
                format_args!(
                    "Callback panicked during expiration check of table {}: {}",
                    self.name(),
                    reason
                ),
            );
        }

        pub(crate) fn cleanup_at(&self) -> Option<Instant> {
            self.read().cleanup_at
        }

        /// Returns a handle that does not keep the table alive.
        pub fn downgrade(&self) -> WeakCacheTable<K> {
            WeakCacheTable {
                shared: Arc::downgrade(&self.shared),
            }
        }

        fn insert(&self, item: Arc<CacheItem<K>>) -> Arc<CacheItem<K>> {
            let callbacks = {
                let mut state = self.write();
                self.insert_locked(&mut state, Arc::clone(&item));
                state.added_item.clone()
            };
            for callback in &callbacks {
                callback(&item);
            }
            item
        }

        fn insert_locked(&self, state: &mut TableState<K>, item: Arc<CacheItem<K>>) {
            state.log(
                Level::Debug,
                format_args!(
                    "Adding item with key {:?} and lifespan of {:?} to table {}",
                    item.key(),
                    item.life_span(),
                    self.name()
                ),
            );
            if let Some(deadline) = item.deadline() {
                if state.cleanup_at.is_none_or(|at| deadline < at) {
                    state.cleanup_at = Some(deadline);
                    self.wake_sweeper();
                }
            }
            state.items.insert(item.key().clone(), item);
        }

        /// A pending wake-up is enough for the sweeper to re-read `cleanup_at`,
        /// so a full channel is not an error.
        fn wake_sweeper(&self) {
            let _ = self.shared.wake.try_send(());
        }

        fn read(&self) -> RwLockReadGuard<'_, TableState<K>> {
            self.shared.state.read().unwrap_or_else(PoisonError::into_inner)
        }

        fn write(&self) -> RwLockWriteGuard<'_, TableState<K>> {
            self.shared.state.write().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

mod table_state {
    use std::{collections::HashMap, panic::Location, sync::Arc, time::Instant};

    use log::{Level, Log, Record};

    use crate::{CacheItem, CacheKey};

    use super::callbacks::{DataLoader, ItemCallback};

    /// Everything guarded by the table lock.
    pub(crate) struct TableState<K: CacheKey> {
        pub(crate) items: HashMap<K, Arc<CacheItem<K>>>,
        /// Wake time of the sweeper. `None` while idle.
        pub(crate) cleanup_at: Option<Instant>,
        /// Number of flushes so far.
        pub(crate) flushes: u64,
        pub(crate) loader: Option<DataLoader<K>>,
        pub(crate) added_item: Vec<ItemCallback<K>>,
        pub(crate) about_to_delete_item: Vec<ItemCallback<K>>,
        pub(crate) logger: Option<Arc<dyn Log>>,
    }

    impl<K: CacheKey> TableState<K> {
        pub(crate) fn new() -> Self {
            Self {
                items: HashMap::new(),
                cleanup_at: None,
                flushes: 0,
                loader: None,
                added_item: Vec::new(),
                about_to_delete_item: Vec::new(),
                logger: None,
            }
        }

        /// Handles to every item that can expire.
        pub(crate) fn expiring_items(&self) -> Vec<Arc<CacheItem<K>>> {
            self.items
                .values()
                .filter(|item| item.expires())
                .cloned()
                .collect()
        }

        /// Writes to the table's own sink when one is set, to the `log` facade otherwise.
        /// Records carry the file and line of the caller.
        #[track_caller]
        pub(crate) fn log(&self, level: Level, args: std::fmt::Arguments<'_>) {
            let location = Location::caller();
            let record = Record::builder()
                .args(args)
                .level(level)
                .target(crate::LOG_TARGET)
                .file_static(Some(location.file()))
                .line(Some(location.line()))
                .build();
            match &self.logger {
                Some(logger) => logger.log(&record),
                None if level <= log::max_level() => log::logger().log(&record),
                None => {}
            }
        }
    }
}

mod sweep {
    use std::{sync::Arc, time::Instant};

    use rayon::prelude::*;

    use crate::{CacheItem, CacheKey};

    /// Splits `items` into those whose deadline has passed at `now`, and the
    /// earliest deadline among the others. At or above `parallel_threshold`
    /// items the scan runs on the rayon pool.
    pub(crate) fn scan<K: CacheKey>(
        items: &[Arc<CacheItem<K>>],
        now: Instant,
        parallel_threshold: usize,
    ) -> (Vec<Arc<CacheItem<K>>>, Option<Instant>) {
        if items.len() >= parallel_threshold {
            let expired: Vec<_> = items
                .par_iter()
                .filter(|item| item.deadline().is_some_and(|at| at <= now))
                .cloned()
                .collect();
            let next = items
                .par_iter()
                .filter_map(|item| item.deadline())
                .filter(|at| *at > now)
                .min();
            return (expired, next);
        }

        let mut expired = Vec::new();
        let mut next: Option<Instant> = None;
        for item in items {
            match item.deadline() {
                Some(at) if at <= now => expired.push(Arc::clone(item)),
                Some(at) => next = Some(next.map_or(at, |earliest| earliest.min(at))),
                None => {}
            }
        }
        (expired, next)
    }
}

mod callbacks {
    use std::sync::Arc;

    use crate::{CacheItem, CacheKey};

    /// Handler fired with an item right after it is added, or right before a
    /// removed item is discarded.
    pub type ItemCallback<K> = Arc<dyn Fn(&Arc<CacheItem<K>>) + Send + Sync + 'static>;

    /// Loader asked for the item on a `value` miss. Returning `None` makes the
    /// lookup fail with `NotFound`.
    pub type DataLoader<K> =
        Arc<dyn Fn(&K, &[&str]) -> Option<CacheItem<K>> + Send + Sync + 'static>;
}
