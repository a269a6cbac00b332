//! Reference-counted byte buffers (`AVBufferRef`)
//!
//! A buffer's bytes come from one of two places: libavutil's allocator, or a
//! [`HostBytes`] block that the native buffer aliases without copying. In the
//! second case the native side holds a strong reference to the host block
//! and gives it back from its free callback, which runs once the last
//! `AVBufferRef` pointing at the block is gone. The wrapper itself only keeps
//! a weak link for data access.

use std::ffi::c_void;
use std::sync::{Arc, Weak};

use ffmpeg_next::ffi;
use parking_lot::{Mutex, MutexGuard};

use super::host::HostBytes;
use crate::error::{check, Error, Result};
use crate::resource::{self, Dependent, HandleTable, Native, Ownership, Resource};

#[derive(Clone)]
enum Backing {
    Native,
    Host(Weak<Mutex<Box<[u8]>>>),
    /// Memory lent by a foreign caller, released through its callback
    Foreign,
}

struct BufferState {
    handle: Native<ffi::AVBufferRef>,
    backing: Backing,
}

/// Wrapper around one `AVBufferRef`
pub struct Buffer {
    state: Mutex<BufferState>,
}

/// Free callback handed to `av_buffer_create` for host-backed buffers
unsafe extern "C" fn release_host(opaque: *mut c_void, _data: *mut u8) {
    drop(Box::from_raw(opaque as *mut HostBytes));
    log::trace!("Native side released host bytes");
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Free callback handed to `av_buffer_create` for foreign memory
unsafe extern "C" fn release_foreign(opaque: *mut c_void, _data: *mut u8) {
    let release = Box::from_raw(opaque as *mut ReleaseFn);
    release();
    log::trace!("Native side released foreign memory");
}

pub(crate) fn non_negative(size: i64, what: &str) -> Result<usize> {
    usize::try_from(size)
        .map_err(|_| Error::InvalidArgument(format!("{} must not be negative, got {}", what, size)))
}

impl Buffer {
    fn adopt(
        ptr: *mut ffi::AVBufferRef,
        ownership: Ownership,
        backing: Backing,
    ) -> Result<Arc<Buffer>> {
        resource::wrap(ptr as usize, ownership, || Buffer {
            state: Mutex::new(BufferState {
                handle: Native::new(ptr, ownership),
                backing,
            }),
        })
    }

    /// Allocate `size` bytes, zero-filled when `zeroed` is set
    pub fn alloc(size: i64, zeroed: bool) -> Result<Arc<Buffer>> {
        let size = non_negative(size, "buffer size")?;
        let ptr = unsafe {
            if zeroed {
                ffi::av_buffer_allocz(size)
            } else {
                ffi::av_buffer_alloc(size)
            }
        };
        if ptr.is_null() {
            return Err(Error::Allocation(Self::KIND));
        }
        Self::adopt(ptr, Ownership::Owned, Backing::Native)
    }

    /// Create a buffer that aliases `bytes` without copying
    pub fn from_host(bytes: &HostBytes) -> Result<Arc<Buffer>> {
        let (data, len) = bytes.raw_parts();
        let opaque = Box::into_raw(Box::new(bytes.clone()));
        let ptr = unsafe {
            ffi::av_buffer_create(data, len, Some(release_host), opaque as *mut c_void, 0)
        };
        if ptr.is_null() {
            drop(unsafe { Box::from_raw(opaque) });
            return Err(Error::Allocation(Self::KIND));
        }
        Self::adopt(ptr, Ownership::Owned, Backing::Host(bytes.downgrade()))
    }

    /// Create a buffer over `len` bytes at `data` without copying.
    /// `on_release` runs exactly once, after the last native reference to
    /// the memory is gone. It does not run when this returns an error.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads and writes of `len` bytes until
    /// `on_release` runs.
    pub unsafe fn from_foreign(
        data: *mut u8,
        len: usize,
        on_release: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Buffer>> {
        let release: ReleaseFn = Box::new(on_release);
        let opaque = Box::into_raw(Box::new(release));
        let ptr = ffi::av_buffer_create(data, len, Some(release_foreign), opaque as *mut c_void, 0);
        if ptr.is_null() {
            drop(Box::from_raw(opaque));
            return Err(Error::Allocation(Self::KIND));
        }
        Self::adopt(ptr, Ownership::Owned, Backing::Foreign)
    }

    /// Wrap a buffer reference produced elsewhere, or return the wrapper that
    /// already represents it.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid `AVBufferRef`. With [`Ownership::Owned`]
    /// the caller hands over one reference, which the wrapper will unref.
    pub unsafe fn from_raw(ptr: *mut ffi::AVBufferRef, ownership: Ownership) -> Result<Arc<Buffer>> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null AVBufferRef".into()));
        }
        Self::adopt(ptr, ownership, Backing::Native)
    }

    /// Borrowed view of a reference held by a parent object
    pub(crate) fn view(ptr: *mut ffi::AVBufferRef) -> Result<Arc<Buffer>> {
        Self::adopt(ptr, Ownership::Borrowed, Backing::Native)
    }

    /// The underlying `AVBufferRef`, null once freed
    pub fn as_ptr(&self) -> *mut ffi::AVBufferRef {
        self.state.lock().handle.raw()
    }

    pub fn size(&self) -> Result<usize> {
        let state = self.state.lock();
        let ptr = state.handle.get(Self::KIND)?;
        Ok(unsafe { (*ptr).size })
    }

    /// Run `f` over the buffer's bytes
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.state.lock();
        let ptr = state.handle.get(Self::KIND)?;
        match &state.backing {
            Backing::Host(host) => {
                let host = host.upgrade().ok_or(Error::FreedResource(Self::KIND))?;
                let bytes = host.lock();
                Ok(f(&bytes))
            }
            Backing::Native | Backing::Foreign => Ok(f(unsafe { native_slice(ptr) })),
        }
    }

    /// Run `f` over the buffer's bytes mutably.
    ///
    /// Natively allocated buffers must be writable (see [`Buffer::make_writable`]).
    /// Host-backed and foreign buffers always are: writes go to the lender's memory.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let state = self.state.lock();
        let ptr = state.handle.get(Self::KIND)?;
        match &state.backing {
            Backing::Host(host) => {
                let host = host.upgrade().ok_or(Error::FreedResource(Self::KIND))?;
                let mut bytes = host.lock();
                Ok(f(&mut bytes))
            }
            Backing::Foreign => Ok(f(unsafe { native_slice_mut(ptr) })),
            Backing::Native => {
                if unsafe { ffi::av_buffer_is_writable(ptr) } == 0 {
                    return Err(Error::ReadOnly(Self::KIND));
                }
                Ok(f(unsafe { native_slice_mut(ptr) }))
            }
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_data(|bytes| bytes.to_vec())
    }

    /// Native reference count, 0 once freed
    pub fn ref_count(&self) -> usize {
        let state = self.state.lock();
        if state.handle.is_null() {
            return 0;
        }
        unsafe { ffi::av_buffer_get_ref_count(state.handle.raw()) as usize }
    }

    /// True iff this is the only reference and the buffer is not read-only
    pub fn is_writable(&self) -> bool {
        let state = self.state.lock();
        if state.handle.is_null() {
            return false;
        }
        unsafe { ffi::av_buffer_is_writable(state.handle.raw()) != 0 }
    }

    /// True while the bytes alias memory lent by the host
    pub fn is_host_backed(&self) -> bool {
        !matches!(self.state.lock().backing, Backing::Native)
    }

    /// True when both wrappers reference the same underlying `AVBuffer`
    pub fn same_storage(&self, other: &Buffer) -> bool {
        if std::ptr::eq(self, other) {
            return !self.is_freed();
        }
        let (a, b) = lock_pair(self, other);
        match (a.handle.get(Self::KIND), b.handle.get(Self::KIND)) {
            (Ok(a), Ok(b)) => unsafe { (*a).buffer == (*b).buffer },
            _ => false,
        }
    }

    /// Ensure this wrapper holds a private, writable copy.
    ///
    /// Host-backed and foreign buffers are always copied into native memory,
    /// since the lender can still write to its block. Otherwise this is a
    /// no-op when the buffer is already writable.
    pub fn make_writable(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        let ptr = state.handle.get(Self::KIND)?;
        if !state.handle.is_owned() {
            return Err(Error::Borrowed(Self::KIND));
        }
        let host_backed = !matches!(state.backing, Backing::Native);
        if !host_backed && unsafe { ffi::av_buffer_is_writable(ptr) } != 0 {
            return Ok(());
        }

        let table = HandleTable::global();
        table.unregister::<Buffer>(ptr as usize, Arc::as_ptr(self));
        let mut slot = ptr;
        let result = if host_backed {
            unsafe { private_copy(&mut slot) }
        } else {
            check(
                unsafe { ffi::av_buffer_make_writable(&mut slot) },
                "av_buffer_make_writable",
            )
            .map(|_| ())
        };
        if let Err(e) = result {
            table.register(ptr as usize, self);
            return Err(e);
        }

        state.handle.replace(slot);
        state.backing = Backing::Native;
        table.register(slot as usize, self);
        log::debug!("Buffer {:#x} made writable as {:#x}", ptr as usize, slot as usize);
        Ok(())
    }

    /// Resize to `size` bytes. The contents up to the smaller of the two
    /// sizes are kept; a host-backed buffer becomes natively backed.
    pub fn realloc(self: &Arc<Self>, size: i64) -> Result<()> {
        let size = non_negative(size, "buffer size")?;
        let mut state = self.state.lock();
        let ptr = state.handle.get(Self::KIND)?;
        if !state.handle.is_owned() {
            return Err(Error::Borrowed(Self::KIND));
        }

        let table = HandleTable::global();
        table.unregister::<Buffer>(ptr as usize, Arc::as_ptr(self));
        let mut slot = ptr;
        if let Err(e) = check(
            unsafe { ffi::av_buffer_realloc(&mut slot, size) },
            "av_buffer_realloc",
        ) {
            table.register(ptr as usize, self);
            return Err(e);
        }

        state.handle.replace(slot);
        state.backing = Backing::Native;
        table.register(slot as usize, self);
        Ok(())
    }

    /// Make this wrapper reference the same underlying buffer as `other`.
    /// Nothing happens when the two already share it.
    pub fn replace(self: &Arc<Self>, other: &Arc<Buffer>) -> Result<()> {
        if Arc::ptr_eq(self, other) {
            return Ok(());
        }
        let (mut state, source) = lock_pair(self, other);
        let ptr = state.handle.get(Self::KIND)?;
        let src = source.handle.get(Self::KIND)?;
        if !state.handle.is_owned() {
            return Err(Error::Borrowed(Self::KIND));
        }
        if unsafe { (*ptr).buffer == (*src).buffer } {
            return Ok(());
        }

        let table = HandleTable::global();
        table.unregister::<Buffer>(ptr as usize, Arc::as_ptr(self));
        let mut slot = ptr;
        let code = unsafe { ffi::av_buffer_replace(&mut slot, src) };
        // on failure libavutil leaves the destination unreferenced
        state.handle.replace(slot);
        state.backing = source.backing.clone();
        check(code, "av_buffer_replace")?;
        table.register(slot as usize, self);
        Ok(())
    }

    /// A new owning wrapper holding an additional reference to the same data
    pub fn new_reference(&self) -> Result<Arc<Buffer>> {
        let (ptr, backing) = {
            let state = self.state.lock();
            let ptr = state.handle.get(Self::KIND)?;
            (unsafe { ffi::av_buffer_ref(ptr) }, state.backing.clone())
        };
        if ptr.is_null() {
            return Err(Error::Allocation(Self::KIND));
        }
        Self::adopt(ptr, Ownership::Owned, backing)
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if let Some((mut ptr, ownership)) = state.handle.take() {
            resource::unregister(ptr as usize, self);
            if ownership == Ownership::Owned {
                unsafe { ffi::av_buffer_unref(&mut ptr) };
            }
        }
        state.backing = Backing::Native;
    }
}

impl Resource for Buffer {
    const KIND: &'static str = "AVBuffer";

    fn ownership(&self) -> Ownership {
        self.state.lock().handle.ownership()
    }

    fn is_freed(&self) -> bool {
        self.state.lock().handle.is_null()
    }

    fn free(&self) {
        self.release();
    }

    fn claim_ownership(&self) -> bool {
        self.state.lock().handle.claim()
    }
}

impl Dependent for Buffer {
    fn detach(&self) {
        let mut state = self.state.lock();
        if let Some((ptr, _)) = state.handle.take() {
            resource::unregister(ptr as usize, self);
        }
        state.backing = Backing::Native;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Buffer")
            .field("handle", &state.handle.raw())
            .field("ownership", &state.handle.ownership())
            .field("host_backed", &!matches!(state.backing, Backing::Native))
            .finish()
    }
}

/// Lock two distinct buffers in address order, returning the guards as (a, b)
fn lock_pair<'a>(
    a: &'a Buffer,
    b: &'a Buffer,
) -> (MutexGuard<'a, BufferState>, MutexGuard<'a, BufferState>) {
    if (a as *const Buffer) < (b as *const Buffer) {
        let ga = a.state.lock();
        let gb = b.state.lock();
        (ga, gb)
    } else {
        let gb = b.state.lock();
        let ga = a.state.lock();
        (ga, gb)
    }
}

/// Replace `*slot` with a natively allocated copy of its bytes
unsafe fn private_copy(slot: &mut *mut ffi::AVBufferRef) -> Result<()> {
    let size = (**slot).size;
    let copy = ffi::av_buffer_alloc(size);
    if copy.is_null() {
        return Err(Error::Allocation(Buffer::KIND));
    }
    if size > 0 {
        std::ptr::copy_nonoverlapping((**slot).data, (*copy).data, size);
    }
    ffi::av_buffer_unref(slot);
    *slot = copy;
    Ok(())
}

unsafe fn native_slice<'a>(ptr: *const ffi::AVBufferRef) -> &'a [u8] {
    if (*ptr).data.is_null() || (*ptr).size == 0 {
        &[]
    } else {
        std::slice::from_raw_parts((*ptr).data, (*ptr).size)
    }
}

unsafe fn native_slice_mut<'a>(ptr: *mut ffi::AVBufferRef) -> &'a mut [u8] {
    if (*ptr).data.is_null() || (*ptr).size == 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut((*ptr).data, (*ptr).size)
    }
}
