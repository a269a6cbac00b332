//! libavutil objects: buffers, pools, dictionaries, frames and their children
//!
//! Every wrapper here follows the same lifecycle (see [`crate::resource`]):
//! one `Arc` per native handle, explicit idempotent `free`, and `Drop` as the
//! fallback release path.

pub mod buffer;
pub mod channel_layout;
pub mod class;
pub mod dict;
pub mod frame;
pub mod host;
pub mod pool;
pub mod side_data;

use std::ffi::{c_char, CStr};
use std::fmt;

use ffmpeg_next::ffi;
use ffmpeg_next::util::media::Type as MediaType;
use ffmpeg_next::util::picture::Type as PictureType;
use ffmpeg_next::Rational;

pub use buffer::Buffer;
pub use channel_layout::{ChannelLayout, ChannelOrder};
pub use class::ClassDescriptor;
pub use dict::{DictFlags, Dictionary, DictionaryEntry};
pub use frame::{Crop, Frame};
pub use host::HostBytes;
pub use pool::BufferPool;
pub use side_data::{side_data_name, FrameSideData};

/// `AV_FOURCC_MAX_STRING_SIZE`
const FOURCC_MAX_STRING_SIZE: usize = 32;

/// A libav* library version split into its components
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LibraryVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl From<u32> for LibraryVersion {
    fn from(version: u32) -> Self {
        Self {
            major: version >> 16,
            minor: (version >> 8) & 0xff,
            micro: version & 0xff,
        }
    }
}

impl fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

pub(crate) fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

pub fn avutil_version() -> LibraryVersion {
    LibraryVersion::from(unsafe { ffi::avutil_version() })
}

/// FFmpeg release string, e.g. `"7.1"` or a git describe
pub fn version_info() -> String {
    c_string(unsafe { ffi::av_version_info() })
}

/// Build-time configure flags of libavutil
pub fn configuration() -> String {
    c_string(unsafe { ffi::avutil_configuration() })
}

pub fn license() -> String {
    c_string(unsafe { ffi::avutil_license() })
}

/// Lower-case name of a media type (`"video"`, `"audio"`, ...)
pub fn media_type_string(kind: MediaType) -> Option<String> {
    let name = unsafe { ffi::av_get_media_type_string(kind.into()) };
    if name.is_null() {
        None
    } else {
        Some(c_string(name))
    }
}

/// Single-letter code of a picture type (`'I'`, `'P'`, `'B'`, ...)
pub fn picture_type_char(kind: PictureType) -> char {
    (unsafe { ffi::av_get_picture_type_char(kind.into()) } as u8) as char
}

/// The internal time base, `1/AV_TIME_BASE`
pub fn time_base_q() -> Rational {
    Rational::new(1, ffi::AV_TIME_BASE as i32)
}

/// Printable form of a FourCC, non-printable bytes shown as `[n]`
pub fn fourcc_string(fourcc: u32) -> String {
    let mut buf = [0 as c_char; FOURCC_MAX_STRING_SIZE];
    unsafe { ffi::av_fourcc_make_string(buf.as_mut_ptr(), fourcc) };
    c_string(buf.as_ptr())
}
