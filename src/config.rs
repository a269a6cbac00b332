//! Process-wide bridge configuration

use std::sync::OnceLock;

use ffmpeg_next::ffi;

/// libav* log verbosity, applied with `av_log_set_level`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeLogLevel {
    Quiet,
    Panic,
    Fatal,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl NativeLogLevel {
    /// The `AV_LOG_*` value
    pub fn as_raw(self) -> i32 {
        match self {
            NativeLogLevel::Quiet => -8,
            NativeLogLevel::Panic => 0,
            NativeLogLevel::Fatal => 8,
            NativeLogLevel::Error => 16,
            NativeLogLevel::Warning => 24,
            NativeLogLevel::Info => 32,
            NativeLogLevel::Verbose => 40,
            NativeLogLevel::Debug => 48,
            NativeLogLevel::Trace => 56,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Verbosity of libav*'s own logging
    pub native_log_level: NativeLogLevel,

    /// Bounded job queue depth of each codec worker
    pub codec_queue_depth: usize,

    /// Threads handed to new codec contexts (0 = let libavcodec decide)
    pub codec_thread_count: i32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            native_log_level: NativeLogLevel::Warning,
            codec_queue_depth: 16,
            codec_thread_count: 0,
        }
    }
}

impl BridgeConfig {
    /// Silence libav* entirely
    pub fn quiet() -> Self {
        Self {
            native_log_level: NativeLogLevel::Quiet,
            ..Default::default()
        }
    }

    /// Forward everything libav* has to say, useful while debugging codecs
    pub fn verbose() -> Self {
        Self {
            native_log_level: NativeLogLevel::Debug,
            ..Default::default()
        }
    }

    /// Short queues and a single codec thread
    pub fn low_latency() -> Self {
        Self {
            codec_queue_depth: 2,
            codec_thread_count: 1,
            ..Default::default()
        }
    }

    pub(crate) fn apply(&self) {
        unsafe { ffi::av_log_set_level(self.native_log_level.as_raw()) };
    }
}

static CONFIG: OnceLock<BridgeConfig> = OnceLock::new();
static DEFAULT: OnceLock<BridgeConfig> = OnceLock::new();

/// Install the process-wide configuration. The first call wins; later calls
/// return `false` and leave the active configuration untouched.
pub fn install(config: BridgeConfig) -> bool {
    install_into(&CONFIG, config)
}

/// The installed configuration, or the default while none is installed.
/// Reading it never installs anything.
pub fn current() -> &'static BridgeConfig {
    current_in(&CONFIG)
}

fn install_into(slot: &OnceLock<BridgeConfig>, config: BridgeConfig) -> bool {
    match slot.set(config) {
        Ok(()) => {
            if let Some(config) = slot.get() {
                config.apply();
            }
            true
        }
        Err(_) => {
            log::warn!("Bridge configuration already installed, ignoring new one");
            false
        }
    }
}

fn current_in(slot: &'static OnceLock<BridgeConfig>) -> &'static BridgeConfig {
    slot.get()
        .unwrap_or_else(|| DEFAULT.get_or_init(BridgeConfig::default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.native_log_level, NativeLogLevel::Warning);
        assert_eq!(config.codec_queue_depth, 16);
        assert_eq!(config.codec_thread_count, 0);
    }

    #[test]
    fn test_presets() {
        assert_eq!(BridgeConfig::quiet().native_log_level.as_raw(), -8);
        assert_eq!(BridgeConfig::verbose().native_log_level.as_raw(), 48);
        let low = BridgeConfig::low_latency();
        assert_eq!(low.codec_queue_depth, 2);
        assert_eq!(low.codec_thread_count, 1);
    }

    #[test]
    fn test_reading_before_install_keeps_install_open() {
        static SLOT: OnceLock<BridgeConfig> = OnceLock::new();

        assert_eq!(current_in(&SLOT).codec_queue_depth, 16);
        assert!(SLOT.get().is_none());

        assert!(install_into(&SLOT, BridgeConfig::low_latency()));
        assert_eq!(current_in(&SLOT).codec_queue_depth, 2);
        assert_eq!(current_in(&SLOT).codec_thread_count, 1);

        assert!(!install_into(&SLOT, BridgeConfig::quiet()));
        assert_eq!(current_in(&SLOT).native_log_level, NativeLogLevel::Warning);
    }

    #[test]
    fn test_current_is_stable() {
        install(BridgeConfig::default());
        let a = current() as *const BridgeConfig;
        let b = current() as *const BridgeConfig;
        assert_eq!(a, b);
    }
}
