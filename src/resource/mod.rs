//! Wrapper base shared by every native type
//!
//! A wrapper pairs one native handle with one `Arc`. Wrappers are created
//! fresh (the wrapper owns what it allocated), from a handle handed out by a
//! native call (borrowed unless the call transferred a reference), or by
//! looking the handle up in the [`HandleTable`]. Dropping the last `Arc` runs
//! the same idempotent release as an explicit [`Resource::free`].

pub mod handle_table;

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};

pub use handle_table::HandleTable;

/// Whether a wrapper releases its native handle when it is done with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The wrapper holds a reference of its own and releases it
    Owned,
    /// The handle belongs to a parent object or a static table
    Borrowed,
}

/// Common lifecycle of a wrapped native object
pub trait Resource: Any + Send + Sync {
    /// Name used in error messages
    const KIND: &'static str;

    fn ownership(&self) -> Ownership;

    /// True once the handle has been released or detached
    fn is_freed(&self) -> bool;

    /// Release the native handle. Owned handles are unreferenced or freed,
    /// borrowed ones are forgotten. Calling it again does nothing.
    fn free(&self);

    /// Take over responsibility for releasing the handle. Returns `false`
    /// when this wrapper already owned it.
    fn claim_ownership(&self) -> bool;
}

/// Raw handle plus its ownership tag
pub(crate) struct Native<T> {
    ptr: *mut T,
    ownership: Ownership,
}

// The pointee is only touched while the enclosing wrapper's Mutex is held.
unsafe impl<T> Send for Native<T> {}
unsafe impl<T> Sync for Native<T> {}

impl<T> Native<T> {
    pub(crate) fn new(ptr: *mut T, ownership: Ownership) -> Self {
        Self { ptr, ownership }
    }

    /// The live pointer, or `FreedResource` naming `kind`
    pub(crate) fn get(&self, kind: &'static str) -> Result<*mut T> {
        if self.ptr.is_null() {
            Err(Error::FreedResource(kind))
        } else {
            Ok(self.ptr)
        }
    }

    pub(crate) fn raw(&self) -> *mut T {
        self.ptr
    }

    pub(crate) fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub(crate) fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    /// Mark as owned, returning `false` if it already was
    pub(crate) fn claim(&mut self) -> bool {
        let was_borrowed = self.ownership == Ownership::Borrowed;
        self.ownership = Ownership::Owned;
        was_borrowed
    }

    /// Point at a new handle after the native side replaced it
    pub(crate) fn replace(&mut self, ptr: *mut T) {
        self.ptr = ptr;
    }

    /// Null the handle, returning what it held
    pub(crate) fn take(&mut self) -> Option<(*mut T, Ownership)> {
        if self.ptr.is_null() {
            None
        } else {
            let ptr = std::mem::replace(&mut self.ptr, std::ptr::null_mut());
            Some((ptr, self.ownership))
        }
    }
}

/// Look `handle` up in the global table or create its wrapper.
///
/// When an existing borrowed wrapper is found and the caller now holds an
/// owning reference, ownership moves to that wrapper so no two wrappers ever
/// both release the same handle.
pub(crate) fn wrap<T, F>(handle: usize, ownership: Ownership, create: F) -> Result<Arc<T>>
where
    T: Resource,
    F: FnOnce() -> T,
{
    let (wrapper, created) =
        HandleTable::global().get_or_insert_with(handle, || Ok(Arc::new(create())))?;
    if created {
        log::debug!("Wrapped {} {:#x} ({:?})", T::KIND, handle, ownership);
    } else if ownership == Ownership::Owned && !wrapper.claim_ownership() {
        log::warn!(
            "{} {:#x} wrapped as owned twice, keeping the existing owner",
            T::KIND,
            handle
        );
    }
    Ok(wrapper)
}

/// Remove `wrapper`'s entry from the global table
pub(crate) fn unregister<T: Resource>(handle: usize, wrapper: &T) {
    HandleTable::global().unregister::<T>(handle, wrapper as *const T);
}

/// A borrowed view that must stop touching its handle once the parent
/// changes shape or goes away
pub(crate) trait Dependent: Send + Sync {
    fn detach(&self);
}

/// Views handed out by a parent wrapper
#[derive(Default)]
pub(crate) struct Dependents {
    views: Mutex<Vec<Weak<dyn Dependent>>>,
}

impl Dependents {
    pub(crate) fn track<D: Dependent + 'static>(&self, view: &Arc<D>) {
        let view: Arc<dyn Dependent> = view.clone();
        let weak = Arc::downgrade(&view);
        let mut views = self.views.lock();
        views.retain(|v| v.strong_count() > 0);
        if !views.iter().any(|v| Weak::ptr_eq(v, &weak)) {
            views.push(weak);
        }
    }

    /// Detach every live view and forget them. Views tracked by a view while
    /// it was being detached are picked up on the next pass.
    pub(crate) fn detach_all(&self) {
        loop {
            let views = std::mem::take(&mut *self.views.lock());
            if views.is_empty() {
                break;
            }
            for view in views.iter().filter_map(Weak::upgrade) {
                view.detach();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.views.lock().iter().filter(|v| v.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct View {
        detached: AtomicBool,
    }

    impl Dependent for View {
        fn detach(&self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_native_take_is_idempotent() {
        let mut value = 5u8;
        let mut native = Native::new(&mut value as *mut u8, Ownership::Owned);
        assert!(native.get("cell").is_ok());
        assert!(native.take().is_some());
        assert!(native.take().is_none());
        assert!(matches!(native.get("cell"), Err(Error::FreedResource("cell"))));
    }

    #[test]
    fn test_native_claim() {
        let mut value = 0u8;
        let mut native = Native::new(&mut value as *mut u8, Ownership::Borrowed);
        assert!(native.claim());
        assert!(native.is_owned());
        assert!(!native.claim());
    }

    #[test]
    fn test_detach_all_reaches_live_views() {
        let dependents = Dependents::default();
        let kept = Arc::new(View {
            detached: AtomicBool::new(false),
        });
        let dropped = Arc::new(View {
            detached: AtomicBool::new(false),
        });
        dependents.track(&kept);
        dependents.track(&kept);
        dependents.track(&dropped);
        drop(dropped);

        assert_eq!(dependents.live(), 1);
        dependents.detach_all();
        assert!(kept.detached.load(Ordering::SeqCst));
        assert_eq!(dependents.live(), 0);
    }
}
