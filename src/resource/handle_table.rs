//! Identity map from native handles to their live wrappers
//!
//! The table only ever holds weak references. An entry whose wrapper has been
//! dropped is stale and reads as absent; it is replaced on the next register
//! and swept by [`HandleTable::purge_stale`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::error::Result;

type Key = (TypeId, usize);
type Erased = Weak<dyn Any + Send + Sync>;

/// Weak map keyed by `(wrapper type, handle address)`
pub struct HandleTable {
    entries: Mutex<HashMap<Key, Erased>>,
}

static GLOBAL: OnceLock<HandleTable> = OnceLock::new();

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide table used by every wrapper type
    pub fn global() -> &'static HandleTable {
        GLOBAL.get_or_init(HandleTable::new)
    }

    fn key<T: Any>(handle: usize) -> Key {
        (TypeId::of::<T>(), handle)
    }

    fn erase<T: Any + Send + Sync>(wrapper: &Arc<T>) -> Erased {
        let erased: Arc<dyn Any + Send + Sync> = wrapper.clone();
        Arc::downgrade(&erased)
    }

    /// Associate `handle` with `wrapper`, replacing any previous entry
    pub fn register<T: Any + Send + Sync>(&self, handle: usize, wrapper: &Arc<T>) {
        let weak = Self::erase(wrapper);
        let previous = self.entries.lock().insert(Self::key::<T>(handle), weak);
        if let Some(previous) = previous {
            if previous.strong_count() > 0 && !ptr_eq(&previous, Arc::as_ptr(wrapper)) {
                log::warn!(
                    "Handle {:#x} re-registered while its previous wrapper is still alive",
                    handle
                );
            }
        }
        log::trace!("Registered {} at {:#x}", std::any::type_name::<T>(), handle);
    }

    /// The live wrapper for `handle`, if there is one
    pub fn lookup<T: Any + Send + Sync>(&self, handle: usize) -> Option<Arc<T>> {
        let strong = {
            let entries = self.entries.lock();
            entries.get(&Self::key::<T>(handle))?.upgrade()?
        };
        strong.downcast::<T>().ok()
    }

    /// Drop the entry for `handle` if it belongs to `wrapper` or is stale.
    ///
    /// An entry that has since been taken over by another live wrapper is left alone.
    pub fn unregister<T: Any>(&self, handle: usize, wrapper: *const T) {
        let mut entries = self.entries.lock();
        let key = Self::key::<T>(handle);
        let remove = match entries.get(&key) {
            Some(entry) => entry.strong_count() == 0 || ptr_eq(entry, wrapper),
            None => false,
        };
        if remove {
            entries.remove(&key);
            log::trace!("Unregistered {} at {:#x}", std::any::type_name::<T>(), handle);
        }
    }

    /// Return the live wrapper for `handle`, or build and register one with
    /// `create`. The lookup and the insert happen under one lock, so two
    /// threads wrapping the same handle always agree on a single wrapper.
    ///
    /// The returned flag is `true` when `create` ran.
    pub fn get_or_insert_with<T, F>(&self, handle: usize, create: F) -> Result<(Arc<T>, bool)>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<Arc<T>>,
    {
        let key = Self::key::<T>(handle);
        let mut entries = self.entries.lock();
        let existing = entries.get(&key).and_then(Weak::upgrade);
        if let Some(existing) = existing {
            drop(entries);
            if let Ok(wrapper) = existing.downcast::<T>() {
                return Ok((wrapper, false));
            }
            return Err(crate::error::Error::InvalidArgument(format!(
                "handle {:#x} is registered with a different wrapper type",
                handle
            )));
        }
        let wrapper = create()?;
        entries.insert(key, Self::erase(&wrapper));
        log::trace!("Registered {} at {:#x}", std::any::type_name::<T>(), handle);
        Ok((wrapper, true))
    }

    /// Move the entry for `wrapper` from `old` to `new` after its handle changed
    pub fn rekey<T: Any + Send + Sync>(&self, old: usize, new: usize, wrapper: &Arc<T>) {
        if old == new {
            return;
        }
        self.unregister::<T>(old, Arc::as_ptr(wrapper));
        self.register(new, wrapper);
    }

    /// Remove every stale entry, returning how many were dropped
    pub fn purge_stale(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, weak| weak.strong_count() > 0);
        before - entries.len()
    }

    /// Number of entries, stale ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

fn ptr_eq<T>(entry: &Erased, wrapper: *const T) -> bool {
    entry.as_ptr() as *const () == wrapper as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Wrapper(u32);
    struct OtherWrapper;

    #[test]
    fn test_lookup_returns_registered_wrapper() {
        let table = HandleTable::new();
        let wrapper = Arc::new(Wrapper(7));
        table.register(0x1000, &wrapper);

        let found = table.lookup::<Wrapper>(0x1000).unwrap();
        assert!(Arc::ptr_eq(&found, &wrapper));
        assert_eq!(found.0, 7);
    }

    #[test]
    fn test_lookup_after_drop_is_absent() {
        let table = HandleTable::new();
        let wrapper = Arc::new(Wrapper(1));
        table.register(0x2000, &wrapper);
        drop(wrapper);

        assert!(table.lookup::<Wrapper>(0x2000).is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.purge_stale(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_entry_is_replaced() {
        let table = HandleTable::new();
        let first = Arc::new(Wrapper(1));
        table.register(0x3000, &first);
        drop(first);

        let second = Arc::new(Wrapper(2));
        table.register(0x3000, &second);
        assert_eq!(table.lookup::<Wrapper>(0x3000).unwrap().0, 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_types_do_not_collide() {
        let table = HandleTable::new();
        let first = Arc::new(Wrapper(3));
        let other = Arc::new(OtherWrapper);
        table.register(0x4000, &first);
        table.register(0x4000, &other);

        assert!(table.lookup::<Wrapper>(0x4000).is_some());
        assert!(table.lookup::<OtherWrapper>(0x4000).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_unregister_leaves_foreign_entry() {
        let table = HandleTable::new();
        let current = Arc::new(Wrapper(1));
        let previous = Arc::new(Wrapper(2));
        table.register(0x5000, &current);

        table.unregister::<Wrapper>(0x5000, Arc::as_ptr(&previous));
        assert!(table.lookup::<Wrapper>(0x5000).is_some());

        table.unregister::<Wrapper>(0x5000, Arc::as_ptr(&current));
        assert!(table.lookup::<Wrapper>(0x5000).is_none());
    }

    #[test]
    fn test_get_or_insert_with_reuses_live_wrapper() {
        let table = HandleTable::new();
        let (first, created) = table
            .get_or_insert_with(0x6000, || Ok(Arc::new(Wrapper(1))))
            .unwrap();
        assert!(created);

        let (second, created) = table
            .get_or_insert_with(0x6000, || Ok(Arc::new(Wrapper(2))))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_rekey_moves_entry() {
        let table = HandleTable::new();
        let wrapper = Arc::new(Wrapper(9));
        table.register(0x7000, &wrapper);
        table.rekey(0x7000, 0x8000, &wrapper);

        assert!(table.lookup::<Wrapper>(0x7000).is_none());
        assert!(Arc::ptr_eq(&table.lookup::<Wrapper>(0x8000).unwrap(), &wrapper));
    }

    #[test]
    fn test_concurrent_wraps_agree() {
        let table = Arc::new(HandleTable::new());
        let keep = Arc::new(Mutex::new(Vec::new()));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                let keep = keep.clone();
                std::thread::spawn(move || {
                    let (wrapper, _) = table
                        .get_or_insert_with(0x9000, || Ok(Arc::new(Wrapper(i))))
                        .unwrap();
                    keep.lock().push(wrapper);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let keep = keep.lock();
        assert!(keep.iter().all(|w| Arc::ptr_eq(w, &keep[0])));
    }
}
