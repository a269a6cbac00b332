//! Codec descriptors (`AVCodec`)

use std::ffi::{c_void, CString};
use std::sync::Arc;

use ffmpeg_next::codec::Id;
use ffmpeg_next::ffi;
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::util::media::Type as MediaType;
use ffmpeg_next::Rational;
use parking_lot::Mutex;

use crate::avutil::c_string;
use crate::avutil::channel_layout::ChannelLayout;
use crate::avutil::class::ClassDescriptor;
use crate::error::{Error, Result};
use crate::resource::{self, Native, Ownership, Resource};

/// `AV_PROFILE_UNKNOWN`, the terminator of `AVCodec.profiles`
const PROFILE_UNKNOWN: i32 = -99;

/// One entry of a codec's profile table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: i32,
    pub name: String,
}

/// Pointers to the elements of a static array ending at the first element
/// for which `is_end` holds. A null array yields nothing.
unsafe fn terminated<T>(mut ptr: *const T, is_end: impl Fn(&T) -> bool) -> Vec<*const T> {
    let mut items = Vec::new();
    if ptr.is_null() {
        return items;
    }
    while !is_end(&*ptr) {
        items.push(ptr);
        ptr = ptr.add(1);
    }
    items
}

/// A registered encoder or decoder.
///
/// Codecs are static tables inside libavcodec. Wrappers are always borrowed
/// and a given codec always maps to the same `Arc<Codec>`.
pub struct Codec {
    codec: Mutex<Native<ffi::AVCodec>>,
}

impl Codec {
    pub(crate) fn view(ptr: *const ffi::AVCodec) -> Result<Arc<Codec>> {
        let ptr = ptr as *mut ffi::AVCodec;
        resource::wrap(ptr as usize, Ownership::Borrowed, || Codec {
            codec: Mutex::new(Native::new(ptr, Ownership::Borrowed)),
        })
    }

    fn found(ptr: *const ffi::AVCodec, what: impl FnOnce() -> String) -> Result<Arc<Codec>> {
        if ptr.is_null() {
            return Err(Error::NotFound(what()));
        }
        Self::view(ptr)
    }

    pub fn find_decoder(id: Id) -> Result<Arc<Codec>> {
        let ptr = unsafe { ffi::avcodec_find_decoder(id.into()) };
        Self::found(ptr, || format!("decoder for {:?}", id))
    }

    pub fn find_encoder(id: Id) -> Result<Arc<Codec>> {
        let ptr = unsafe { ffi::avcodec_find_encoder(id.into()) };
        Self::found(ptr, || format!("encoder for {:?}", id))
    }

    pub fn find_decoder_by_name(name: &str) -> Result<Arc<Codec>> {
        let c_name = codec_name(name)?;
        let ptr = unsafe { ffi::avcodec_find_decoder_by_name(c_name.as_ptr()) };
        Self::found(ptr, || format!("decoder '{}'", name))
    }

    pub fn find_encoder_by_name(name: &str) -> Result<Arc<Codec>> {
        let c_name = codec_name(name)?;
        let ptr = unsafe { ffi::avcodec_find_encoder_by_name(c_name.as_ptr()) };
        Self::found(ptr, || format!("encoder '{}'", name))
    }

    /// Every codec compiled into libavcodec
    pub fn all() -> Result<Vec<Arc<Codec>>> {
        let mut opaque: *mut c_void = std::ptr::null_mut();
        let mut codecs = Vec::new();
        loop {
            let ptr = unsafe { ffi::av_codec_iterate(&mut opaque) };
            if ptr.is_null() {
                break;
            }
            codecs.push(Self::view(ptr)?);
        }
        Ok(codecs)
    }

    pub(crate) fn as_ptr(&self) -> *const ffi::AVCodec {
        self.codec.lock().raw()
    }

    fn read<R>(&self, f: impl FnOnce(&ffi::AVCodec) -> R) -> Result<R> {
        let codec = self.codec.lock();
        let ptr = codec.get(Self::KIND)?;
        Ok(f(unsafe { &*ptr }))
    }

    pub fn name(&self) -> Result<String> {
        self.read(|c| c_string(c.name))
    }

    pub fn long_name(&self) -> Result<String> {
        self.read(|c| c_string(c.long_name))
    }

    pub fn media_type(&self) -> Result<MediaType> {
        self.read(|c| MediaType::from(c.type_))
    }

    pub fn id(&self) -> Result<Id> {
        self.read(|c| Id::from(c.id))
    }

    /// `AV_CODEC_CAP_*` bits
    pub fn capabilities(&self) -> Result<i32> {
        self.read(|c| c.capabilities)
    }

    pub fn is_encoder(&self) -> Result<bool> {
        self.read(|c| unsafe { ffi::av_codec_is_encoder(c) } != 0)
    }

    pub fn is_decoder(&self) -> Result<bool> {
        self.read(|c| unsafe { ffi::av_codec_is_decoder(c) } != 0)
    }

    /// Wrapped external library, e.g. `"libx264"`, `None` for native codecs
    pub fn wrapper_name(&self) -> Result<Option<String>> {
        self.read(|c| (!c.wrapper_name.is_null()).then(|| c_string(c.wrapper_name)))
    }

    /// Highest `lowres` value the decoder supports, 0 when it has none
    pub fn max_lowres(&self) -> Result<i32> {
        self.read(|c| c.max_lowres as i32)
    }

    /// Profiles the codec recognises, empty when it lists none
    pub fn profiles(&self) -> Result<Vec<Profile>> {
        self.read(|c| unsafe {
            terminated(c.profiles, |p| p.profile == PROFILE_UNKNOWN)
                .into_iter()
                .map(|p| Profile {
                    id: (*p).profile,
                    name: c_string((*p).name),
                })
                .collect()
        })
    }

    /// Name of profile `id` for this codec
    pub fn profile_name(&self, id: i32) -> Result<Option<String>> {
        self.read(|c| {
            let name = unsafe { ffi::av_get_profile_name(c, id) };
            (!name.is_null()).then(|| c_string(name))
        })
    }

    /// Pixel formats an encoder accepts, empty when unrestricted or unknown
    pub fn pixel_formats(&self) -> Result<Vec<Pixel>> {
        self.read(|c| unsafe {
            terminated(c.pix_fmts, |f| *f == ffi::AVPixelFormat::AV_PIX_FMT_NONE)
                .into_iter()
                .map(|f| Pixel::from(*f))
                .collect()
        })
    }

    /// Sample formats an encoder accepts, empty when unrestricted or unknown
    pub fn sample_formats(&self) -> Result<Vec<Sample>> {
        self.read(|c| unsafe {
            terminated(c.sample_fmts, |f| *f == ffi::AVSampleFormat::AV_SAMPLE_FMT_NONE)
                .into_iter()
                .map(|f| Sample::from(*f))
                .collect()
        })
    }

    pub fn supported_sample_rates(&self) -> Result<Vec<i32>> {
        self.read(|c| unsafe {
            terminated(c.supported_samplerates, |rate| *rate == 0)
                .into_iter()
                .map(|rate| *rate)
                .collect()
        })
    }

    pub fn supported_frame_rates(&self) -> Result<Vec<Rational>> {
        self.read(|c| unsafe {
            terminated(c.supported_framerates, |r| r.num == 0 && r.den == 0)
                .into_iter()
                .map(|r| Rational::from(*r))
                .collect()
        })
    }

    /// Borrowed views of the channel layouts an encoder accepts
    pub fn channel_layouts(&self) -> Result<Vec<Arc<ChannelLayout>>> {
        let layouts = self.read(|c| unsafe {
            terminated(c.ch_layouts, |l| {
                l.nb_channels == 0 && l.order == ffi::AVChannelOrder::AV_CHANNEL_ORDER_UNSPEC
            })
        })?;
        layouts
            .into_iter()
            .map(|l| ChannelLayout::view(l as *mut ffi::AVChannelLayout))
            .collect()
    }

    /// Class of the codec's private options, if it has any
    pub fn private_class(&self) -> Result<Option<Arc<ClassDescriptor>>> {
        let class = self.read(|c| c.priv_class)?;
        if class.is_null() {
            return Ok(None);
        }
        ClassDescriptor::view(class).map(Some)
    }
}

fn codec_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidArgument("codec name contains a NUL byte".into()))
}

impl Resource for Codec {
    const KIND: &'static str = "AVCodec";

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

impl Drop for Codec {
    fn drop(&mut self) {
        let addr = self.codec.lock().addr();
        resource::unregister(addr, self);
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("name", &self.name().unwrap_or_default())
            .finish()
    }
}
