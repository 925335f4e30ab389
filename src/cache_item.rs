pub use item::{CacheItem, ExpireCallback};
pub use key::CacheKey;

mod item {
    use std::{
        fmt::Debug,
        sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
        time::{Duration, Instant},
    };

    use bytes::Bytes;

    use super::key::CacheKey;

    /// Handler invoked with the key of an item right before the sweeper evicts it.
    pub type ExpireCallback<K> = Arc<dyn Fn(&K) + Send + Sync + 'static>;

    /// Mutable part of an item, guarded by the item's own lock.
    struct ItemState<K> {
        accessed_on: Instant,
        about_to_expire: Vec<ExpireCallback<K>>,
    }

    /// A single cached key/payload pair with its expiration metadata.
    ///
    /// Key, payload, lifespan and creation time never change after construction.
    /// The last access time and the about-to-expire callbacks sit behind a
    /// per-item lock, so refreshing one item never blocks other items.
    ///
    /// An item whose lifespan is [`Duration::ZERO`] never expires; it only leaves
    /// its table through `delete`, `flush` or an overwriting `add`.
    ///
    /// ### Example
    /// ```rust
    /// use hourglass_cache::CacheItem;
    /// use std::time::Duration;
    ///
    /// let item = CacheItem::new("key".to_string(), "value", Duration::from_secs(5));
    /// item.keep_alive();
    /// assert!(item.accessed_on() >= item.created_on());
    /// assert_eq!(&item.data()[..], b"value");
    /// ```
    pub struct CacheItem<K: CacheKey> {
        key: K,
        data: Bytes,
        life_span: Duration,
        created_on: Instant,
        state: RwLock<ItemState<K>>,
    }

    impl<K: CacheKey> CacheItem<K> {
        /// Creates an item whose creation and access times are both `Instant::now()`.
        pub fn new(key: K, data: impl Into<Bytes>, life_span: Duration) -> Self {
            let now = Instant::now();
            Self {
                key,
                data: data.into(),
                life_span,
                created_on: now,
                state: RwLock::new(ItemState {
                    accessed_on: now,
                    about_to_expire: Vec::new(),
                }),
            }
        }

        /// Marks the item as accessed now, starting a fresh idle window.
        pub fn keep_alive(&self) {
            self.write().accessed_on = Instant::now();
        }

        pub fn key(&self) -> &K {
            &self.key
        }

        pub fn data(&self) -> &Bytes {
            &self.data
        }

        /// Idle duration after which the item is evicted. Zero means never.
        pub fn life_span(&self) -> Duration {
            self.life_span
        }

        /// Returns `true` if the sweeper may ever evict this item.
        pub fn expires(&self) -> bool {
            !self.life_span.is_zero()
        }

        pub fn created_on(&self) -> Instant {
            self.created_on
        }

        pub fn accessed_on(&self) -> Instant {
            self.read().accessed_on
        }

        /// Replaces every about-to-expire callback with `f`.
        pub fn set_about_to_expire_callback(&self, f: impl Fn(&K) + Send + Sync + 'static) {
            let mut state = self.write();
            state.about_to_expire.clear();
            state.about_to_expire.push(Arc::new(f));
        }

        /// Appends `f` after the already registered about-to-expire callbacks.
        pub fn add_about_to_expire_callback(&self, f: impl Fn(&K) + Send + Sync + 'static) {
            self.write().about_to_expire.push(Arc::new(f));
        }

        pub fn remove_about_to_expire_callbacks(&self) {
            self.write().about_to_expire.clear();
        }

        /// Moment the item becomes eligible for eviction, if it ever does.
        /// A lifespan too large to represent as an `Instant` never ends.
        pub(crate) fn deadline(&self) -> Option<Instant> {
            if !self.expires() {
                return None;
            }
            self.accessed_on().checked_add(self.life_span)
        }

        /// Decides expiry and runs `evict` while holding the item's write lock,
        /// so a concurrent `keep_alive` lands either before the decision or after
        /// the eviction. Returns the expire callbacks to fire when evicted.
        pub(crate) fn expire_with(
            &self,
            now: Instant,
            evict: impl FnOnce(),
        ) -> Option<Vec<ExpireCallback<K>>> {
            let state = self.write();
            if !self.expires() || now.saturating_duration_since(state.accessed_on) < self.life_span
            {
                return None;
            }
            evict();
            Some(state.about_to_expire.clone())
        }

        /// Rebinds a freshly loaded item to the key it was requested under.
        pub(crate) fn with_key(self, key: K) -> Self {
            Self { key, ..self }
        }

        fn read(&self) -> RwLockReadGuard<'_, ItemState<K>> {
            self.state.read().unwrap_or_else(PoisonError::into_inner)
        }

        fn write(&self) -> RwLockWriteGuard<'_, ItemState<K>> {
            self.state.write().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl<K: CacheKey> Debug for CacheItem<K> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("CacheItem")
                .field("key", &self.key)
                .field("data_len", &self.data.len())
                .field("life_span", &self.life_span)
                .field("created_on", &self.created_on)
                .field("accessed_on", &self.accessed_on())
                .finish()
        }
    }
}

mod key {
    use std::{fmt::Debug, hash::Hash};

    /// Trait implemented by types that can be used as keys of a [`CacheTable`](crate::CacheTable).
    ///
    /// Keys are stored in the table map, handed to expire callbacks and moved
    /// into the sweeper thread, hence the bounds:
    /// - clonable, hashable and comparable (via `Eq`),
    /// - thread-safe (`Send + Sync`) and `'static`,
    /// - `Debug`, so diagnostic lines can name them.
    ///
    /// ### Blanket implementation
    /// ```rust,ignore
    /// impl<T: Clone + Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {}
    /// ```
    /// `String`, `usize`, `Ipv4Addr` and most plain key types qualify as is.
    pub trait CacheKey: Clone + Hash + Eq + Debug + Send + Sync + 'static {}

    impl<T: Clone + Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {}
}
