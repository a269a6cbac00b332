//! Host-owned byte storage that native buffers can alias without copying

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A shared, heap-stable block of bytes owned by the host side.
///
/// Cloning shares the same storage. The allocation never moves or resizes,
/// so a native buffer created over it stays valid for as long as one strong
/// reference is alive.
#[derive(Clone)]
pub struct HostBytes {
    inner: Arc<Mutex<Box<[u8]>>>,
}

impl HostBytes {
    /// `len` zeroed bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bytes.into_boxed_slice())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().to_vec()
    }

    /// Number of strong holders, the native side included while it aliases this storage
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<Mutex<Box<[u8]>>> {
        Arc::downgrade(&self.inner)
    }

    /// Stable data pointer and length for `av_buffer_create`
    pub(crate) fn raw_parts(&self) -> (*mut u8, usize) {
        let mut guard = self.inner.lock();
        (guard.as_mut_ptr(), guard.len())
    }
}

impl std::fmt::Debug for HostBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBytes")
            .field("len", &self.len())
            .field("holders", &self.holders())
            .finish()
    }
}
