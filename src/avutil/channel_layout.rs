//! Audio channel layouts (`AVChannelLayout`)

use std::ffi::{c_char, c_void, CString};
use std::sync::Arc;

use ffmpeg_next::ffi;
use parking_lot::Mutex;

use super::c_string;
use crate::error::{check, Error, Result};
use crate::resource::{self, Dependent, Native, Ownership, Resource};

/// How the channels of a layout are described
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Unspecified,
    Native,
    Custom,
    Ambisonic,
    Unknown(i32),
}

impl From<ffi::AVChannelOrder> for ChannelOrder {
    fn from(order: ffi::AVChannelOrder) -> Self {
        match order {
            ffi::AVChannelOrder::AV_CHANNEL_ORDER_UNSPEC => ChannelOrder::Unspecified,
            ffi::AVChannelOrder::AV_CHANNEL_ORDER_NATIVE => ChannelOrder::Native,
            ffi::AVChannelOrder::AV_CHANNEL_ORDER_CUSTOM => ChannelOrder::Custom,
            ffi::AVChannelOrder::AV_CHANNEL_ORDER_AMBISONIC => ChannelOrder::Ambisonic,
            #[allow(unreachable_patterns)]
            other => ChannelOrder::Unknown(other as i32),
        }
    }
}

/// Wrapper around an `AVChannelLayout`.
///
/// Layouts built with the constructors here are owned. Entries of the
/// standard table and layouts embedded in frames or codec contexts are
/// borrowed.
pub struct ChannelLayout {
    layout: Mutex<Native<ffi::AVChannelLayout>>,
}

fn empty_layout() -> *mut ffi::AVChannelLayout {
    Box::into_raw(Box::new(unsafe { std::mem::zeroed::<ffi::AVChannelLayout>() }))
}

impl ChannelLayout {
    fn owned(
        init: impl FnOnce(*mut ffi::AVChannelLayout) -> Result<()>,
    ) -> Result<Arc<ChannelLayout>> {
        let ptr = empty_layout();
        if let Err(e) = init(ptr) {
            unsafe {
                ffi::av_channel_layout_uninit(ptr);
                drop(Box::from_raw(ptr));
            }
            return Err(e);
        }
        resource::wrap(ptr as usize, Ownership::Owned, || ChannelLayout {
            layout: Mutex::new(Native::new(ptr, Ownership::Owned)),
        })
    }

    /// Borrowed view of a layout owned by a parent struct or a static table
    pub(crate) fn view(ptr: *mut ffi::AVChannelLayout) -> Result<Arc<ChannelLayout>> {
        resource::wrap(ptr as usize, Ownership::Borrowed, || ChannelLayout {
            layout: Mutex::new(Native::new(ptr, Ownership::Borrowed)),
        })
    }

    /// Native-order layout from a channel bitmask
    pub fn from_mask(mask: u64) -> Result<Arc<ChannelLayout>> {
        Self::owned(|ptr| {
            check(
                unsafe { ffi::av_channel_layout_from_mask(ptr, mask) },
                "av_channel_layout_from_mask",
            )
            .map(|_| ())
        })
    }

    /// Parse a layout description such as `"stereo"` or `"5.1(side)"`
    pub fn from_string(description: &str) -> Result<Arc<ChannelLayout>> {
        let description = CString::new(description)
            .map_err(|_| Error::InvalidArgument("layout description contains a NUL byte".into()))?;
        Self::owned(|ptr| {
            check(
                unsafe { ffi::av_channel_layout_from_string(ptr, description.as_ptr()) },
                "av_channel_layout_from_string",
            )
            .map(|_| ())
        })
    }

    /// The default layout for `channels` channels
    pub fn default_for(channels: i32) -> Result<Arc<ChannelLayout>> {
        if channels < 0 {
            return Err(Error::InvalidArgument(format!(
                "channel count must not be negative, got {}",
                channels
            )));
        }
        Self::owned(|ptr| {
            unsafe { ffi::av_channel_layout_default(ptr, channels) };
            Ok(())
        })
    }

    /// Every standard layout known to libavutil
    pub fn standard() -> Result<Vec<Arc<ChannelLayout>>> {
        let mut iter: *mut c_void = std::ptr::null_mut();
        let mut layouts = Vec::new();
        loop {
            let layout = unsafe { ffi::av_channel_layout_standard(&mut iter) };
            if layout.is_null() {
                break;
            }
            layouts.push(Self::view(layout as *mut ffi::AVChannelLayout)?);
        }
        Ok(layouts)
    }

    fn read<R>(&self, f: impl FnOnce(&ffi::AVChannelLayout) -> R) -> Result<R> {
        let layout = self.layout.lock();
        let ptr = layout.get(Self::KIND)?;
        Ok(f(unsafe { &*ptr }))
    }

    pub fn channel_count(&self) -> Result<i32> {
        self.read(|l| l.nb_channels)
    }

    pub fn order(&self) -> Result<ChannelOrder> {
        self.read(|l| ChannelOrder::from(l.order))
    }

    /// The channel bitmask, for native and ambisonic layouts
    pub fn mask(&self) -> Result<Option<u64>> {
        self.read(|l| match ChannelOrder::from(l.order) {
            ChannelOrder::Native | ChannelOrder::Ambisonic => Some(unsafe { l.u.mask }),
            _ => None,
        })
    }

    /// Channel ids in order, for custom layouts
    pub fn custom_channels(&self) -> Result<Option<Vec<i32>>> {
        self.read(|l| {
            if ChannelOrder::from(l.order) != ChannelOrder::Custom {
                return None;
            }
            let map = unsafe { l.u.map };
            if map.is_null() {
                return Some(Vec::new());
            }
            let count = l.nb_channels.max(0) as usize;
            Some(
                (0..count)
                    .map(|i| unsafe { (*map.add(i)).id as i32 })
                    .collect(),
            )
        })
    }

    /// Human-readable description, e.g. `"stereo"`
    pub fn describe(&self) -> Result<String> {
        let layout = self.layout.lock();
        let ptr = layout.get(Self::KIND)?;
        let mut buf = vec![0 as c_char; 64];
        loop {
            let needed = check(
                unsafe { ffi::av_channel_layout_describe(ptr, buf.as_mut_ptr(), buf.len()) },
                "av_channel_layout_describe",
            )? as usize;
            if needed <= buf.len() {
                break;
            }
            buf.resize(needed, 0);
        }
        Ok(c_string(buf.as_ptr()))
    }

    /// True when both describe the same channels in the same order
    pub fn same_as(&self, other: &ChannelLayout) -> Result<bool> {
        if std::ptr::eq(self, other) {
            return Ok(!self.is_freed());
        }
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };
        let first = first.layout.lock();
        let second = second.layout.lock();
        let a = first.get(Self::KIND)?;
        let b = second.get(Self::KIND)?;
        Ok(unsafe { ffi::av_channel_layout_compare(a, b) } == 0)
    }

    /// Copy this layout into `dst`, which must hold an initialised or zeroed layout
    pub(crate) fn copy_into(&self, dst: *mut ffi::AVChannelLayout) -> Result<()> {
        let layout = self.layout.lock();
        let src = layout.get(Self::KIND)?;
        check(
            unsafe { ffi::av_channel_layout_copy(dst, src) },
            "av_channel_layout_copy",
        )?;
        Ok(())
    }

    fn release(&self) {
        if let Some((ptr, ownership)) = self.layout.lock().take() {
            resource::unregister(ptr as usize, self);
            if ownership == Ownership::Owned {
                unsafe {
                    ffi::av_channel_layout_uninit(ptr);
                    drop(Box::from_raw(ptr));
                }
            }
        }
    }
}

impl Resource for ChannelLayout {
    const KIND: &'static str = "AVChannelLayout";

    fn ownership(&self) -> Ownership {
        self.layout.lock().ownership()
    }

    fn is_freed(&self) -> bool {
        self.layout.lock().is_null()
    }

    fn free(&self) {
        self.release();
    }

    fn claim_ownership(&self) -> bool {
        // borrowed layouts are embedded in their parent, never separately allocated
        false
    }
}

impl Dependent for ChannelLayout {
    fn detach(&self) {
        if let Some((ptr, _)) = self.layout.lock().take() {
            resource::unregister(ptr as usize, self);
        }
    }
}

impl Drop for ChannelLayout {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEREO_MASK: u64 = 0x3;

    #[test]
    fn test_from_mask() {
        let layout = ChannelLayout::from_mask(STEREO_MASK).unwrap();
        assert_eq!(layout.channel_count().unwrap(), 2);
        assert_eq!(layout.order().unwrap(), ChannelOrder::Native);
        assert_eq!(layout.mask().unwrap(), Some(STEREO_MASK));
        assert_eq!(layout.describe().unwrap(), "stereo");
        assert_eq!(layout.ownership(), Ownership::Owned);
    }

    #[test]
    fn test_from_string_and_default() {
        let parsed = ChannelLayout::from_string("stereo").unwrap();
        let default = ChannelLayout::default_for(2).unwrap();
        assert!(parsed.same_as(&default).unwrap());
        assert!(ChannelLayout::from_string("not a layout").is_err());
        assert!(ChannelLayout::default_for(-1).is_err());
    }

    #[test]
    fn test_standard_layouts_are_borrowed_and_stable() {
        let first = ChannelLayout::standard().unwrap();
        assert!(!first.is_empty());
        assert!(first.iter().all(|l| l.ownership() == Ownership::Borrowed));

        let second = ChannelLayout::standard().unwrap();
        assert!(Arc::ptr_eq(&first[0], &second[0]));
    }

    #[test]
    fn test_free_is_idempotent() {
        let layout = ChannelLayout::from_mask(STEREO_MASK).unwrap();
        layout.free();
        layout.free();
        assert!(matches!(
            layout.channel_count(),
            Err(Error::FreedResource("AVChannelLayout"))
        ));
    }
}
