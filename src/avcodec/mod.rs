//! libavcodec objects: codecs, packets and codec contexts

pub mod codec;
pub mod context;
pub mod packet;

use ffmpeg_next::ffi;

use crate::avutil::{c_string, LibraryVersion};

pub use codec::{Codec, Profile};
pub use context::CodecContext;
pub use packet::Packet;

pub fn avcodec_version() -> LibraryVersion {
    LibraryVersion::from(unsafe { ffi::avcodec_version() })
}

/// Build-time configure flags of libavcodec
pub fn avcodec_configuration() -> String {
    c_string(unsafe { ffi::avcodec_configuration() })
}

pub fn avcodec_license() -> String {
    c_string(unsafe { ffi::avcodec_license() })
}

pub fn avformat_version() -> LibraryVersion {
    LibraryVersion::from(unsafe { ffi::avformat_version() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_versions() {
        assert!(avcodec_version().major >= 60);
        assert!(avformat_version().major >= 60);
        assert!(!avcodec_license().is_empty());
        let _ = avcodec_configuration();
    }
}
