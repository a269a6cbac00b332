//! avbind-core - ownership and handle-identity bridge over libav*
//!
//! This crate wraps libav* objects so a host runtime can hold them safely:
//! - One wrapper per native handle, found again through a process-wide
//!   handle table
//! - Explicit owned/borrowed tagging, so a handle is released exactly once
//! - Zero-copy buffers backed by host memory
//! - Borrowed views into frames and dictionaries that detach instead of
//!   dangling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │           FFI Layer                  │
//! │  (C exports via #[no_mangle])        │
//! └─────────────────────────────────────┘
//!                  │
//!                  ▼
//! ┌─────────────────────────────────────┐
//! │    avutil / avcodec wrappers         │
//! │  (Buffer, Frame, Dictionary, ...)    │
//! └─────────────────────────────────────┘
//!          │                  │
//!          ▼                  ▼
//! ┌──────────────────┐ ┌──────────────────┐
//! │ Resource Module  │ │ Threading Module │
//! │ (handle table)   │ │ (codec workers)  │
//! └──────────────────┘ └──────────────────┘
//! ```

pub mod avcodec;
pub mod avutil;
pub mod config;
pub mod error;
pub mod ffi;
pub mod resource;
pub mod threading;

// Re-export main types
pub use avcodec::{Codec, CodecContext, Packet, Profile};
pub use avutil::{
    Buffer, BufferPool, ChannelLayout, ClassDescriptor, DictFlags, Dictionary, DictionaryEntry,
    Frame, FrameSideData, HostBytes,
};
pub use config::{BridgeConfig, NativeLogLevel};
pub use error::{Error, Result};
pub use resource::{HandleTable, Ownership, Resource};
pub use threading::{CodecEvent, CodecWorker};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library with the default configuration (call once at startup)
pub fn init() {
    init_with_config(BridgeConfig::default());
}

/// Initialize logging and install `config` as the process-wide configuration.
/// Only the first installed configuration takes effect.
pub fn init_with_config(config: BridgeConfig) {
    // Initialize logging with info level by default if RUST_LOG is not set
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    config::install(config);
    log::info!(
        "avbind-core {} initialized (libavutil {})",
        VERSION,
        avutil::avutil_version()
    );
}

/// The active configuration
pub fn config() -> &'static BridgeConfig {
    config::current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init() {
        init();
        init();
        assert!(config().codec_queue_depth > 0);
    }
}
