//! Error types for avbind-core

use std::ffi::CStr;

use ffmpeg_next::ffi;
use thiserror::Error;

/// Result type alias for avbind-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by wrapper operations
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected before any native call was made
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The wrapper's native handle has already been released
    #[error("{0} has already been freed")]
    FreedResource(&'static str),

    /// Handle-replacing operation on a wrapper that does not own its handle
    #[error("{0} is borrowed from its parent and cannot replace its handle")]
    Borrowed(&'static str),

    /// Write access to shared or read-only native memory
    #[error("{0} is not writable")]
    ReadOnly(&'static str),

    /// A libav* call returned a negative status
    #[error("{operation} failed with error {code}: {message}")]
    Native {
        code: i32,
        operation: &'static str,
        message: String,
    },

    /// A libav* allocator returned NULL
    #[error("Failed to allocate {0}")]
    Allocation(&'static str),

    /// Lookup by name or id found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),
}

impl Error {
    /// Convert to FFI error code
    pub fn to_ffi_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 1,
            Error::FreedResource(_) => 2,
            Error::Native { code, .. } => *code,
            Error::Allocation(_) => 4,
            Error::Borrowed(_) => 5,
            Error::ReadOnly(_) => 6,
            Error::NotFound(_) => 7,
            Error::Io(_) => 8,
            Error::Channel(_) => 99,
        }
    }

    /// Create from a libav* status code, tagging the failing call
    pub fn from_native(code: i32, operation: &'static str) -> Self {
        Error::Native {
            code,
            operation,
            message: error_string(code),
        }
    }

    /// True for `AVERROR(EAGAIN)`
    pub fn is_again(&self) -> bool {
        matches!(self, Error::Native { code, .. } if *code == AVERROR_EAGAIN)
    }

    /// True for `AVERROR_EOF`
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Native { code, .. } if *code == ffi::AVERROR_EOF)
    }
}

/// `AVERROR(EAGAIN)`
pub const AVERROR_EAGAIN: i32 = -ffmpeg_next::error::EAGAIN;

/// Describe a libav* status code with `av_strerror`
pub fn error_string(code: i32) -> String {
    let mut buf = [0 as std::ffi::c_char; 256];
    unsafe {
        if ffi::av_strerror(code, buf.as_mut_ptr(), buf.len()) < 0 {
            return format!("Unknown error {}", code);
        }
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

/// Check a libav* return value
#[inline]
pub(crate) fn check(code: i32, operation: &'static str) -> Result<i32> {
    if code < 0 {
        Err(Error::from_native(code, operation))
    } else {
        Ok(code)
    }
}

/// Like [`check`], but `EAGAIN` and `EOF` become `Ok(false)`
#[inline]
pub(crate) fn check_again(code: i32, operation: &'static str) -> Result<bool> {
    if code == AVERROR_EAGAIN || code == ffi::AVERROR_EOF {
        Ok(false)
    } else {
        check(code, operation).map(|_| true)
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(e: crossbeam_channel::RecvError) -> Self {
        Error::Channel(e.to_string())
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(e: crossbeam_channel::SendError<T>) -> Self {
        Error::Channel(e.to_string())
    }
}
