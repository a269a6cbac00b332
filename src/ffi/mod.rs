//! FFI exports for C hosts
//!
//! All functions in this module are exported with `#[no_mangle]` and use
//! C-compatible types. Objects cross the boundary as opaque boxed handles,
//! each holding one `Arc` to its wrapper. `*_release` drops that `Arc`,
//! which frees the native object once nothing else holds it; `*_free`
//! releases the native object right away and leaves the handle valid but
//! freed.

use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::{Arc, OnceLock};

use crate::avutil::{self, Buffer, BufferPool, DictFlags, Dictionary, HostBytes};
use crate::error::{Error, Result};
use crate::resource::Resource;

// Thread-local error storage
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static LAST_CODE: Cell<i32> = const { Cell::new(0) };
}

fn set_last_error(error: &Error) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(error.to_string()).ok();
    });
    LAST_CODE.with(|c| c.set(error.to_ffi_code()));
}

// =============================================================================
// Result Type
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvbResult {
    Success = 0,
    ErrorInvalidArgument = 1,
    ErrorFreedResource = 2,
    ErrorNative = 3,
    ErrorAllocation = 4,
    ErrorBorrowed = 5,
    ErrorReadOnly = 6,
    ErrorNotFound = 7,
    ErrorInvalidHandle = 8,
    ErrorUnknown = 99,
}

impl From<Error> for AvbResult {
    fn from(e: Error) -> Self {
        set_last_error(&e);
        match e {
            Error::InvalidArgument(_) => AvbResult::ErrorInvalidArgument,
            Error::FreedResource(_) => AvbResult::ErrorFreedResource,
            Error::Native { .. } => AvbResult::ErrorNative,
            Error::Allocation(_) => AvbResult::ErrorAllocation,
            Error::Borrowed(_) => AvbResult::ErrorBorrowed,
            Error::ReadOnly(_) => AvbResult::ErrorReadOnly,
            Error::NotFound(_) => AvbResult::ErrorNotFound,
            _ => AvbResult::ErrorUnknown,
        }
    }
}

impl<T> From<Result<T>> for AvbResult {
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(_) => AvbResult::Success,
            Err(e) => e.into(),
        }
    }
}

/// Box the value of `result` as a handle, or record the error and return null
fn into_handle<T, H>(result: Result<T>, wrap: impl FnOnce(T) -> H) -> *mut H {
    match result {
        Ok(value) => Box::into_raw(Box::new(wrap(value))),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

unsafe fn c_str<'a>(s: *const c_char, what: &str) -> Result<&'a str> {
    if s.is_null() {
        return Err(Error::InvalidArgument(format!("{} is null", what)));
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| Error::InvalidArgument(format!("Invalid UTF-8 in {}", what)))
}

// =============================================================================
// Opaque Handles
// =============================================================================

/// Opaque buffer handle
pub struct AvbBufferHandle {
    buffer: Arc<Buffer>,
}

/// Opaque buffer pool handle
pub struct AvbPoolHandle {
    pool: Arc<BufferPool>,
}

/// Opaque dictionary handle
pub struct AvbDictHandle {
    dict: Arc<Dictionary>,
}

// =============================================================================
// Library
// =============================================================================

/// Initialize the library (sets up logging and the native log level).
/// Call once at application startup.
#[no_mangle]
pub extern "C" fn avb_init() {
    crate::init();
}

/// Get last error message, null when none is recorded
#[no_mangle]
pub extern "C" fn avb_get_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null()))
}

/// Status code of the last error: a negative libav* code for native
/// failures, otherwise the `AvbResult` value
#[no_mangle]
pub extern "C" fn avb_get_last_error_code() -> i32 {
    LAST_CODE.with(|c| c.get())
}

/// Clear last error
#[no_mangle]
pub extern "C" fn avb_clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
    LAST_CODE.with(|c| c.set(0));
}

static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
static FFMPEG_VERSION: OnceLock<CString> = OnceLock::new();

/// Get library version
#[no_mangle]
pub extern "C" fn avb_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Get the FFmpeg release string of the linked libavutil
#[no_mangle]
pub extern "C" fn avb_get_ffmpeg_version() -> *const c_char {
    FFMPEG_VERSION
        .get_or_init(|| CString::new(avutil::version_info()).unwrap_or_default())
        .as_ptr()
}

/// Free a string returned by this library
#[no_mangle]
pub extern "C" fn avb_string_free(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            drop(CString::from_raw(s));
        }
    }
}

// =============================================================================
// Buffers
// =============================================================================

/// Allocate a native buffer
#[no_mangle]
pub extern "C" fn avb_buffer_alloc(size: i64, zeroed: bool) -> *mut AvbBufferHandle {
    into_handle(Buffer::alloc(size, zeroed), |buffer| AvbBufferHandle { buffer })
}

/// Create a buffer holding a copy of `len` bytes at `data`
#[no_mangle]
pub extern "C" fn avb_buffer_from_bytes(data: *const u8, len: usize) -> *mut AvbBufferHandle {
    if data.is_null() && len > 0 {
        set_last_error(&Error::InvalidArgument("data is null".into()));
        return ptr::null_mut();
    }
    let bytes = if len == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }.to_vec()
    };
    let host = HostBytes::from_vec(bytes);
    into_handle(Buffer::from_host(&host), |buffer| AvbBufferHandle { buffer })
}

/// Called once the native side no longer references memory lent with
/// `avb_buffer_wrap`
pub type AvbReleaseCallback = Option<unsafe extern "C" fn(opaque: *mut c_void, data: *mut u8)>;

struct LentMemory {
    release: AvbReleaseCallback,
    opaque: *mut c_void,
    data: *mut u8,
}

// The callback may run on whichever thread drops the last reference.
unsafe impl Send for LentMemory {}

impl LentMemory {
    fn release(self) {
        if let Some(release) = self.release {
            unsafe { release(self.opaque, self.data) };
        }
    }
}

/// Create a buffer over `len` bytes of caller memory without copying.
/// `release` runs exactly once, after the last reference is gone; it is not
/// called when this returns null. Reallocating or making the buffer
/// writable moves its contents into native memory.
#[no_mangle]
pub extern "C" fn avb_buffer_wrap(
    data: *mut u8,
    len: usize,
    release: AvbReleaseCallback,
    opaque: *mut c_void,
) -> *mut AvbBufferHandle {
    if data.is_null() && len > 0 {
        set_last_error(&Error::InvalidArgument("data is null".into()));
        return ptr::null_mut();
    }
    let lent = LentMemory {
        release,
        opaque,
        data,
    };
    let result = unsafe { Buffer::from_foreign(data, len, move || lent.release()) };
    into_handle(result, |buffer| AvbBufferHandle { buffer })
}

/// Get buffer size, -1 on error
#[no_mangle]
pub extern "C" fn avb_buffer_size(handle: *const AvbBufferHandle) -> i64 {
    if handle.is_null() {
        return -1;
    }
    let handle = unsafe { &*handle };
    match handle.buffer.size() {
        Ok(size) => size as i64,
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Copy up to `capacity` bytes into `out`. Returns the number of bytes
/// copied, -1 on error.
#[no_mangle]
pub extern "C" fn avb_buffer_read(
    handle: *const AvbBufferHandle,
    out: *mut u8,
    capacity: usize,
) -> i64 {
    if handle.is_null() || (out.is_null() && capacity > 0) {
        return -1;
    }
    let handle = unsafe { &*handle };
    let copied = handle.buffer.with_data(|bytes| {
        let n = bytes.len().min(capacity);
        if n > 0 {
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), out, n) };
        }
        n
    });
    match copied {
        Ok(n) => n as i64,
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Write `len` bytes at `offset`
#[no_mangle]
pub extern "C" fn avb_buffer_write(
    handle: *const AvbBufferHandle,
    offset: usize,
    data: *const u8,
    len: usize,
) -> AvbResult {
    if handle.is_null() {
        return AvbResult::ErrorInvalidHandle;
    }
    if data.is_null() && len > 0 {
        return Error::InvalidArgument("data is null".into()).into();
    }
    let handle = unsafe { &*handle };
    let result = handle.buffer.with_data_mut(|bytes| -> Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "write of {} bytes at {} exceeds buffer of {}",
                    len,
                    offset,
                    bytes.len()
                ))
            })?;
        if len > 0 {
            let src = unsafe { std::slice::from_raw_parts(data, len) };
            bytes[offset..end].copy_from_slice(src);
        }
        Ok(())
    });
    result.and_then(|r| r).into()
}

/// Get reference count, 0 when freed or null
#[no_mangle]
pub extern "C" fn avb_buffer_ref_count(handle: *const AvbBufferHandle) -> u32 {
    if handle.is_null() {
        return 0;
    }
    let handle = unsafe { &*handle };
    handle.buffer.ref_count() as u32
}

/// Check if writable
#[no_mangle]
pub extern "C" fn avb_buffer_is_writable(handle: *const AvbBufferHandle) -> bool {
    if handle.is_null() {
        return false;
    }
    let handle = unsafe { &*handle };
    handle.buffer.is_writable()
}

#[no_mangle]
pub extern "C" fn avb_buffer_make_writable(handle: *const AvbBufferHandle) -> AvbResult {
    if handle.is_null() {
        return AvbResult::ErrorInvalidHandle;
    }
    let handle = unsafe { &*handle };
    handle.buffer.make_writable().into()
}

#[no_mangle]
pub extern "C" fn avb_buffer_realloc(handle: *const AvbBufferHandle, size: i64) -> AvbResult {
    if handle.is_null() {
        return AvbResult::ErrorInvalidHandle;
    }
    let handle = unsafe { &*handle };
    handle.buffer.realloc(size).into()
}

/// New handle holding a second native reference to the same data
#[no_mangle]
pub extern "C" fn avb_buffer_new_reference(
    handle: *const AvbBufferHandle,
) -> *mut AvbBufferHandle {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let handle = unsafe { &*handle };
    into_handle(handle.buffer.new_reference(), |buffer| AvbBufferHandle {
        buffer,
    })
}

/// Release the native reference now. The handle stays valid.
#[no_mangle]
pub extern "C" fn avb_buffer_free(handle: *const AvbBufferHandle) {
    if !handle.is_null() {
        let handle = unsafe { &*handle };
        handle.buffer.free();
    }
}

#[no_mangle]
pub extern "C" fn avb_buffer_is_freed(handle: *const AvbBufferHandle) -> bool {
    if handle.is_null() {
        return true;
    }
    let handle = unsafe { &*handle };
    handle.buffer.is_freed()
}

/// Destroy the handle
#[no_mangle]
pub extern "C" fn avb_buffer_release(handle: *mut AvbBufferHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}

// =============================================================================
// Buffer Pools
// =============================================================================

#[no_mangle]
pub extern "C" fn avb_pool_create(buffer_size: i64) -> *mut AvbPoolHandle {
    into_handle(BufferPool::new(buffer_size), |pool| AvbPoolHandle { pool })
}

/// Take a buffer from the pool, null on error
#[no_mangle]
pub extern "C" fn avb_pool_get(handle: *const AvbPoolHandle) -> *mut AvbBufferHandle {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let handle = unsafe { &*handle };
    into_handle(handle.pool.get(), |buffer| AvbBufferHandle { buffer })
}

/// Mark the pool for teardown. Buffers already taken stay valid.
#[no_mangle]
pub extern "C" fn avb_pool_free(handle: *const AvbPoolHandle) {
    if !handle.is_null() {
        let handle = unsafe { &*handle };
        handle.pool.free();
    }
}

#[no_mangle]
pub extern "C" fn avb_pool_is_freed(handle: *const AvbPoolHandle) -> bool {
    if handle.is_null() {
        return true;
    }
    let handle = unsafe { &*handle };
    handle.pool.is_freed()
}

/// Destroy the handle
#[no_mangle]
pub extern "C" fn avb_pool_release(handle: *mut AvbPoolHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}

// =============================================================================
// Dictionaries
// =============================================================================

#[no_mangle]
pub extern "C" fn avb_dict_create() -> *mut AvbDictHandle {
    into_handle(Dictionary::new(), |dict| AvbDictHandle { dict })
}

/// Set `key` to `value`, or remove it when `value` is null
#[no_mangle]
pub extern "C" fn avb_dict_set(
    handle: *const AvbDictHandle,
    key: *const c_char,
    value: *const c_char,
    flags: i32,
) -> AvbResult {
    if handle.is_null() {
        return AvbResult::ErrorInvalidHandle;
    }
    let handle = unsafe { &*handle };
    let result = (|| -> Result<()> {
        let key = unsafe { c_str(key, "key")? };
        let value = if value.is_null() {
            None
        } else {
            Some(unsafe { c_str(value, "value")? })
        };
        handle
            .dict
            .set(key, value, DictFlags::from_bits_truncate(flags))
    })();
    result.into()
}

/// Look up `key`. Returns a string to be freed with `avb_string_free`, or
/// null when absent or on error.
#[no_mangle]
pub extern "C" fn avb_dict_get(
    handle: *const AvbDictHandle,
    key: *const c_char,
    flags: i32,
) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let handle = unsafe { &*handle };
    let result = unsafe { c_str(key, "key") }.and_then(|key| {
        handle
            .dict
            .get_value(key, DictFlags::from_bits_truncate(flags))
    });
    match result {
        Ok(Some(value)) => CString::new(value)
            .map(CString::into_raw)
            .unwrap_or(ptr::null_mut()),
        Ok(None) => ptr::null_mut(),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Number of entries, -1 on error
#[no_mangle]
pub extern "C" fn avb_dict_count(handle: *const AvbDictHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let handle = unsafe { &*handle };
    match handle.dict.count() {
        Ok(count) => count as i32,
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Destroy the handle
#[no_mangle]
pub extern "C" fn avb_dict_release(handle: *mut AvbDictHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}
