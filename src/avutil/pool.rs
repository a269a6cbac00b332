//! Buffer pools (`AVBufferPool`)

use std::sync::Arc;

use ffmpeg_next::ffi;
use parking_lot::Mutex;

use super::buffer::{non_negative, Buffer};
use crate::error::{Error, Result};
use crate::resource::{Native, Ownership, Resource};

/// Issues fixed-size buffers, recycling the storage of released ones.
///
/// Fresh storage is zero-filled. Recycled storage keeps whatever the previous
/// holder wrote.
pub struct BufferPool {
    pool: Mutex<Native<ffi::AVBufferPool>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: i64) -> Result<Arc<BufferPool>> {
        let buffer_size = non_negative(buffer_size, "pool buffer size")?;
        let ptr = unsafe { ffi::av_buffer_pool_init(buffer_size, Some(ffi::av_buffer_allocz)) };
        if ptr.is_null() {
            return Err(Error::Allocation(Self::KIND));
        }
        log::debug!("Created buffer pool of {} byte buffers", buffer_size);
        Ok(Arc::new(BufferPool {
            pool: Mutex::new(Native::new(ptr, Ownership::Owned)),
            buffer_size,
        }))
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the pool
    pub fn get(&self) -> Result<Arc<Buffer>> {
        let pool = self.pool.lock();
        let ptr = pool.get(Self::KIND)?;
        let buffer = unsafe { ffi::av_buffer_pool_get(ptr) };
        if buffer.is_null() {
            return Err(Error::Allocation(Buffer::KIND));
        }
        unsafe { Buffer::from_raw(buffer, Ownership::Owned) }
    }

    /// True once the pool has been marked for teardown
    pub fn freed(&self) -> bool {
        self.pool.lock().is_null()
    }
}

impl Resource for BufferPool {
    const KIND: &'static str = "AVBufferPool";

    fn ownership(&self) -> Ownership {
        Ownership::Owned
    }

    fn is_freed(&self) -> bool {
        self.freed()
    }

    /// Mark the pool for teardown. libavutil frees it once every buffer it
    /// issued has been released, so outstanding buffers stay valid.
    fn free(&self) {
        if let Some((mut ptr, _)) = self.pool.lock().take() {
            unsafe { ffi::av_buffer_pool_uninit(&mut ptr) };
            log::debug!("Buffer pool marked for teardown");
        }
    }

    fn claim_ownership(&self) -> bool {
        false
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_free_fails() {
        let pool = BufferPool::new(64).unwrap();
        assert!(!pool.freed());
        pool.free();
        assert!(pool.freed());
        assert!(matches!(pool.get(), Err(Error::FreedResource("AVBufferPool"))));
        pool.free();
    }

    #[test]
    fn test_negative_size_rejected() {
        assert!(matches!(BufferPool::new(-1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let pool = BufferPool::new(123).unwrap();
        let first = pool.get().unwrap();
        assert_eq!(first.size().unwrap(), 123);
        first.with_data_mut(|bytes| bytes[0] = 37).unwrap();
        drop(first);

        let second = pool.get().unwrap();
        assert_eq!(second.with_data(|bytes| bytes[0]).unwrap(), 37);
    }

    #[test]
    fn test_buffer_in_use_is_not_reused() {
        let pool = BufferPool::new(123).unwrap();
        let first = pool.get().unwrap();
        first.with_data_mut(|bytes| bytes[0] = 37).unwrap();

        let second = pool.get().unwrap();
        assert!(!first.same_storage(&second));
        assert_ne!(second.with_data(|bytes| bytes[0]).unwrap(), 37);
    }

    #[test]
    fn test_outstanding_buffer_survives_pool_free() {
        let pool = BufferPool::new(16).unwrap();
        let buffer = pool.get().unwrap();
        pool.free();
        buffer.with_data_mut(|bytes| bytes[15] = 1).unwrap();
        assert_eq!(buffer.to_vec().unwrap()[15], 1);
    }
}
