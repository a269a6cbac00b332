//! Frame side data (`AVFrameSideData`)

use std::ptr;
use std::sync::Arc;

use ffmpeg_next::ffi;
use ffmpeg_next::util::frame::side_data::Type as SideDataType;
use parking_lot::Mutex;

use super::buffer::Buffer;
use super::c_string;
use super::dict::Dictionary;
use crate::error::{Error, Result};
use crate::resource::{self, Dependent, Dependents, Native, Ownership, Resource};

/// Borrowed view of one side-data entry of a frame.
///
/// The frame owns the entry. The view detaches when the frame's side data
/// is changed or released. Its metadata and buffer views are tracked by the
/// frame, so they stay usable after this view is dropped.
pub struct FrameSideData {
    handle: Mutex<Native<ffi::AVFrameSideData>>,
    frame_views: Arc<Dependents>,
}

/// Registered name of a side-data kind
pub fn side_data_name(kind: SideDataType) -> String {
    c_string(unsafe { ffi::av_frame_side_data_name(kind.into()) })
}

impl FrameSideData {
    pub(crate) fn view(
        ptr: *mut ffi::AVFrameSideData,
        frame_views: &Arc<Dependents>,
    ) -> Result<Arc<FrameSideData>> {
        resource::wrap(ptr as usize, Ownership::Borrowed, || FrameSideData {
            handle: Mutex::new(Native::new(ptr, Ownership::Borrowed)),
            frame_views: frame_views.clone(),
        })
    }

    fn read<R>(&self, f: impl FnOnce(*mut ffi::AVFrameSideData) -> R) -> Result<R> {
        let handle = self.handle.lock();
        let ptr = handle.get(Self::KIND)?;
        Ok(f(ptr))
    }

    pub fn kind(&self) -> Result<SideDataType> {
        self.read(|sd| unsafe { SideDataType::from((*sd).type_) })
    }

    pub fn name(&self) -> Result<String> {
        Ok(side_data_name(self.kind()?))
    }

    pub fn size(&self) -> Result<usize> {
        self.read(|sd| unsafe { (*sd).size })
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.read(|sd| unsafe {
            if (*sd).data.is_null() || (*sd).size == 0 {
                f(&[])
            } else {
                f(std::slice::from_raw_parts((*sd).data, (*sd).size))
            }
        })
    }

    /// Write into the entry. Fails while its buffer is shared with another frame.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let handle = self.handle.lock();
        let sd = handle.get(Self::KIND)?;
        unsafe {
            if !(*sd).buf.is_null() && ffi::av_buffer_is_writable((*sd).buf) == 0 {
                return Err(Error::ReadOnly(Self::KIND));
            }
            if (*sd).data.is_null() || (*sd).size == 0 {
                Ok(f(&mut []))
            } else {
                Ok(f(std::slice::from_raw_parts_mut((*sd).data, (*sd).size)))
            }
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_data(|bytes| bytes.to_vec())
    }

    /// The entry's own metadata dictionary
    pub fn metadata(&self) -> Result<Arc<Dictionary>> {
        let handle = self.handle.lock();
        let ptr = handle.get(Self::KIND)?;
        let view = Dictionary::view(unsafe { ptr::addr_of_mut!((*ptr).metadata) })?;
        self.frame_views.track(&view);
        Ok(view)
    }

    /// The buffer reference backing the entry's data
    pub fn buffer(&self) -> Result<Option<Arc<Buffer>>> {
        let handle = self.handle.lock();
        let ptr = handle.get(Self::KIND)?;
        let buf = unsafe { (*ptr).buf };
        if buf.is_null() {
            return Ok(None);
        }
        let view = Buffer::view(buf)?;
        self.frame_views.track(&view);
        Ok(Some(view))
    }
}

impl Resource for FrameSideData {
    const KIND: &'static str = "AVFrameSideData";

    fn ownership(&self) -> Ownership {
        Ownership::Borrowed
    }

    fn is_freed(&self) -> bool {
        self.handle.lock().is_null()
    }

    /// Side data belongs to its frame. Freeing the view only forgets it.
    fn free(&self) {
        self.detach();
    }

    fn claim_ownership(&self) -> bool {
        false
    }
}

impl Dependent for FrameSideData {
    fn detach(&self) {
        let mut handle = self.handle.lock();
        if let Some((ptr, _)) = handle.take() {
            resource::unregister(ptr as usize, self);
        }
    }
}

impl Drop for FrameSideData {
    fn drop(&mut self) {
        self.detach();
    }
}
