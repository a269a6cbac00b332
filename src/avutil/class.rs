//! Class descriptors (`AVClass`)

use std::sync::Arc;

use ffmpeg_next::ffi;
use parking_lot::Mutex;

use super::c_string;
use crate::error::{Error, Result};
use crate::resource::{self, Native, Ownership, Resource};

/// A static `AVClass` describing a libav* struct type.
///
/// Class descriptors live in libav*'s read-only data and are never owned, so
/// `free` does nothing.
pub struct ClassDescriptor {
    class: Mutex<Native<ffi::AVClass>>,
}

impl ClassDescriptor {
    pub(crate) fn view(ptr: *const ffi::AVClass) -> Result<Arc<ClassDescriptor>> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null AVClass".into()));
        }
        let ptr = ptr as *mut ffi::AVClass;
        resource::wrap(ptr as usize, Ownership::Borrowed, || ClassDescriptor {
            class: Mutex::new(Native::new(ptr, Ownership::Borrowed)),
        })
    }

    fn read<R>(&self, f: impl FnOnce(&ffi::AVClass) -> R) -> Result<R> {
        let class = self.class.lock();
        let ptr = class.get(Self::KIND)?;
        Ok(f(unsafe { &*ptr }))
    }

    pub fn name(&self) -> Result<String> {
        self.read(|c| c_string(c.class_name))
    }

    /// `LIBAVUTIL_VERSION_INT` the class was built against
    pub fn version(&self) -> Result<u32> {
        self.read(|c| c.version as u32)
    }

    /// `AVClassCategory` as its integer value
    pub fn category(&self) -> Result<i32> {
        self.read(|c| c.category as i32)
    }
}

impl Resource for ClassDescriptor {
    const KIND: &'static str = "AVClass";

    fn ownership(&self) -> Ownership {
        Ownership::Borrowed
    }

    fn is_freed(&self) -> bool {
        false
    }

    fn free(&self) {}

    fn claim_ownership(&self) -> bool {
        false
    }
}

impl Drop for ClassDescriptor {
    fn drop(&mut self) {
        let addr = self.class.lock().addr();
        resource::unregister(addr, self);
    }
}

impl std::fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name().unwrap_or_default())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_context_class() {
        let class = ClassDescriptor::view(unsafe { ffi::avcodec_get_class() }).unwrap();
        assert_eq!(class.name().unwrap(), "AVCodecContext");
        assert!(class.version().unwrap() > 0);
        assert_eq!(class.ownership(), Ownership::Borrowed);

        class.free();
        assert!(!class.is_freed());
        assert_eq!(class.name().unwrap(), "AVCodecContext");
    }

    #[test]
    fn test_same_class_same_wrapper() {
        let a = ClassDescriptor::view(unsafe { ffi::avcodec_get_class() }).unwrap();
        let b = ClassDescriptor::view(unsafe { ffi::avcodec_get_class() }).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_null_class_rejected() {
        assert!(ClassDescriptor::view(std::ptr::null()).is_err());
    }
}
