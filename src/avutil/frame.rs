//! Decoded audio/video frames (`AVFrame`)
//!
//! A frame is a composite: plane buffers, extended buffers, side data, a
//! metadata dictionary and a channel layout all live inside it. Reading any
//! of them hands out a borrowed view, looked up in the handle table so that
//! repeated reads return the same wrapper. Whenever the frame changes shape
//! (unref, new reference, reallocation, side-data removal) or is released,
//! every view it handed out is detached and reports `FreedResource` from then
//! on.

use std::ptr;
use std::sync::Arc;

use ffmpeg_next::ffi;
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::util::chroma::Location as ChromaLocation;
use ffmpeg_next::util::color::{Primaries, Range, Space, TransferCharacteristic};
use ffmpeg_next::util::frame::side_data::Type as SideDataType;
use ffmpeg_next::util::picture::Type as PictureType;
use ffmpeg_next::Rational;
use parking_lot::{Mutex, MutexGuard};

use super::buffer::Buffer;
use super::channel_layout::ChannelLayout;
use super::dict::Dictionary;
use super::side_data::FrameSideData;
use crate::error::{check, Error, Result};
use crate::resource::{self, Dependents, Native, Ownership, Resource};

/// `AV_FRAME_FLAG_KEY`
const FRAME_FLAG_KEY: i32 = 1 << 1;
/// `AV_FRAME_FLAG_INTERLACED`
const FRAME_FLAG_INTERLACED: i32 = 1 << 3;
/// `AV_FRAME_FLAG_TOP_FIELD_FIRST`
const FRAME_FLAG_TOP_FIELD_FIRST: i32 = 1 << 4;

/// Cropping offsets in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Crop {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

/// Wrapper around an `AVFrame`
pub struct Frame {
    frame: Mutex<Native<ffi::AVFrame>>,
    /// Shared with side-data views, which track their own views here
    children: Arc<Dependents>,
}

fn timestamp(value: i64) -> Option<i64> {
    if value == ffi::AV_NOPTS_VALUE {
        None
    } else {
        Some(value)
    }
}

impl Frame {
    fn adopt(ptr: *mut ffi::AVFrame, ownership: Ownership) -> Result<Arc<Frame>> {
        resource::wrap(ptr as usize, ownership, || Frame {
            frame: Mutex::new(Native::new(ptr, ownership)),
            children: Arc::default(),
        })
    }

    /// An empty frame with no buffers attached
    pub fn new() -> Result<Arc<Frame>> {
        let ptr = unsafe { ffi::av_frame_alloc() };
        if ptr.is_null() {
            return Err(Error::Allocation(Self::KIND));
        }
        Self::adopt(ptr, Ownership::Owned)
    }

    /// Wrap a frame produced elsewhere, or return its existing wrapper.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid `AVFrame`. With [`Ownership::Owned`] the
    /// wrapper frees it with `av_frame_free`.
    pub unsafe fn from_raw(ptr: *mut ffi::AVFrame, ownership: Ownership) -> Result<Arc<Frame>> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null AVFrame".into()));
        }
        Self::adopt(ptr, ownership)
    }

    /// The underlying `AVFrame`, null once freed
    pub fn as_ptr(&self) -> *mut ffi::AVFrame {
        self.frame.lock().raw()
    }

    fn lock(&self) -> Result<(MutexGuard<'_, Native<ffi::AVFrame>>, *mut ffi::AVFrame)> {
        let guard = self.frame.lock();
        let ptr = guard.get(Self::KIND)?;
        Ok((guard, ptr))
    }

    fn read<R>(&self, f: impl FnOnce(&ffi::AVFrame) -> R) -> Result<R> {
        let (_guard, ptr) = self.lock()?;
        Ok(f(unsafe { &*ptr }))
    }

    /// Update plain fields; never touches buffers or child structs
    fn write(&self, f: impl FnOnce(&mut ffi::AVFrame)) -> Result<()> {
        let (_guard, ptr) = self.lock()?;
        f(unsafe { &mut *ptr });
        Ok(())
    }

    /// Run a native call that may replace buffers, side data or metadata.
    /// Views handed out so far are detached first.
    pub(crate) fn restructure<R>(&self, f: impl FnOnce(*mut ffi::AVFrame) -> R) -> Result<R> {
        let (_guard, ptr) = self.lock()?;
        self.children.detach_all();
        Ok(f(ptr))
    }

    /// Run a native call that only reads the frame
    pub(crate) fn with_ptr<R>(&self, f: impl FnOnce(*mut ffi::AVFrame) -> R) -> Result<R> {
        let (_guard, ptr) = self.lock()?;
        Ok(f(ptr))
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Make this frame another reference to `source`'s data
    pub fn refer_to(&self, source: &Frame) -> Result<()> {
        if ptr::eq(self, source) {
            return Err(Error::InvalidArgument("a frame cannot refer to itself".into()));
        }
        let (dst, src) = lock_pair(self, source);
        let dst = dst.get(Self::KIND)?;
        let src = src.get(Self::KIND)?;
        self.children.detach_all();
        unsafe {
            ffi::av_frame_unref(dst);
            check(ffi::av_frame_ref(dst, src), "av_frame_ref")?;
        }
        Ok(())
    }

    /// A new owned frame referencing the same data
    pub fn try_clone(&self) -> Result<Arc<Frame>> {
        let ptr = {
            let (_guard, ptr) = self.lock()?;
            unsafe { ffi::av_frame_clone(ptr) }
        };
        if ptr.is_null() {
            return Err(Error::Allocation(Self::KIND));
        }
        Self::adopt(ptr, Ownership::Owned)
    }

    /// Copy sample or pixel data into `other`, which must already be
    /// allocated with the same parameters
    pub fn copy_to(&self, other: &Frame) -> Result<()> {
        if ptr::eq(self, other) {
            return Err(Error::InvalidArgument("cannot copy a frame onto itself".into()));
        }
        let (src, dst) = lock_pair(self, other);
        let src = src.get(Self::KIND)?;
        let dst = dst.get(Self::KIND)?;
        check(unsafe { ffi::av_frame_copy(dst, src) }, "av_frame_copy")?;
        Ok(())
    }

    /// Copy metadata-only fields (timestamps, side data, metadata) into `other`
    pub fn copy_properties_to(&self, other: &Frame) -> Result<()> {
        if ptr::eq(self, other) {
            return Ok(());
        }
        let (src, dst) = lock_pair(self, other);
        let src = src.get(Self::KIND)?;
        let dst = dst.get(Self::KIND)?;
        other.children.detach_all();
        check(
            unsafe { ffi::av_frame_copy_props(dst, src) },
            "av_frame_copy_props",
        )?;
        Ok(())
    }

    /// Drop every buffer reference and reset the fields to their defaults
    pub fn unrefer(&self) -> Result<()> {
        self.restructure(|ptr| unsafe { ffi::av_frame_unref(ptr) })
    }

    /// Take over `other`'s references without adding new ones. `other` is
    /// left empty.
    pub fn move_reference_from(&self, other: &Frame) -> Result<()> {
        if ptr::eq(self, other) {
            return Ok(());
        }
        let (dst, src) = lock_pair(self, other);
        let dst = dst.get(Self::KIND)?;
        let src = src.get(Self::KIND)?;
        self.children.detach_all();
        other.children.detach_all();
        unsafe {
            ffi::av_frame_unref(dst);
            ffi::av_frame_move_ref(dst, src);
        }
        Ok(())
    }

    /// Allocate data buffers for the current format and dimensions
    /// (or sample count and channel layout for audio)
    pub fn allocate_buffer(&self, align: i32) -> Result<()> {
        let code = self.restructure(|ptr| unsafe { ffi::av_frame_get_buffer(ptr, align) })?;
        check(code, "av_frame_get_buffer")?;
        Ok(())
    }

    /// True iff every buffer reference of the frame is writable
    pub fn is_writable(&self) -> Result<bool> {
        self.with_ptr(|ptr| unsafe { ffi::av_frame_is_writable(ptr) } != 0)
    }

    /// Copy shared data so that every buffer becomes writable
    pub fn make_writable(&self) -> Result<()> {
        let code = self.restructure(|ptr| unsafe { ffi::av_frame_make_writable(ptr) })?;
        check(code, "av_frame_make_writable")?;
        Ok(())
    }

    /// Crop the data pointers according to the crop fields
    pub fn apply_cropping(&self, flags: i32) -> Result<()> {
        let code = self.with_ptr(|ptr| unsafe { ffi::av_frame_apply_cropping(ptr, flags) })?;
        check(code, "av_frame_apply_cropping")?;
        Ok(())
    }

    // =========================================================================
    // Children
    // =========================================================================

    fn buffer_view(&self, ptr: *mut ffi::AVBufferRef) -> Result<Arc<Buffer>> {
        let view = Buffer::view(ptr)?;
        self.children.track(&view);
        Ok(view)
    }

    /// Views of the plane buffers in `buf`
    pub fn buffers(&self) -> Result<Vec<Arc<Buffer>>> {
        let (_guard, ptr) = self.lock()?;
        let refs: Vec<_> = unsafe { (*ptr).buf }
            .iter()
            .copied()
            .filter(|b| !b.is_null())
            .collect();
        refs.into_iter().map(|b| self.buffer_view(b)).collect()
    }

    /// Views of the buffers beyond the fixed `buf` array (many-channel audio)
    pub fn extended_buffers(&self) -> Result<Vec<Arc<Buffer>>> {
        let (_guard, ptr) = self.lock()?;
        let (base, count) = unsafe { ((*ptr).extended_buf, (*ptr).nb_extended_buf.max(0)) };
        if base.is_null() {
            return Ok(Vec::new());
        }
        (0..count as usize)
            .map(|i| unsafe { *base.add(i) })
            .filter(|b| !b.is_null())
            .map(|b| self.buffer_view(b))
            .collect()
    }

    /// View of the buffer holding `plane`, if any
    pub fn plane_buffer(&self, plane: i32) -> Result<Option<Arc<Buffer>>> {
        let (_guard, ptr) = self.lock()?;
        let buf = unsafe { ffi::av_frame_get_plane_buffer(ptr, plane) };
        if buf.is_null() {
            return Ok(None);
        }
        self.buffer_view(buf).map(Some)
    }

    /// The frame's metadata dictionary
    pub fn metadata(&self) -> Result<Arc<Dictionary>> {
        let (_guard, ptr) = self.lock()?;
        let view = Dictionary::view(unsafe { ptr::addr_of_mut!((*ptr).metadata) })?;
        self.children.track(&view);
        Ok(view)
    }

    /// Attach a new zeroed side-data entry of `size` bytes
    pub fn add_side_data(&self, kind: SideDataType, size: usize) -> Result<Arc<FrameSideData>> {
        let (_guard, ptr) = self.lock()?;
        let sd = unsafe { ffi::av_frame_new_side_data(ptr, kind.into(), size) };
        if sd.is_null() {
            return Err(Error::Allocation(FrameSideData::KIND));
        }
        unsafe { ptr::write_bytes((*sd).data, 0, (*sd).size) };
        let view = FrameSideData::view(sd, &self.children)?;
        self.children.track(&view);
        Ok(view)
    }

    /// The first side-data entry of `kind`
    pub fn side_data(&self, kind: SideDataType) -> Result<Option<Arc<FrameSideData>>> {
        let (_guard, ptr) = self.lock()?;
        let sd = unsafe { ffi::av_frame_get_side_data(ptr, kind.into()) };
        if sd.is_null() {
            return Ok(None);
        }
        let view = FrameSideData::view(sd, &self.children)?;
        self.children.track(&view);
        Ok(Some(view))
    }

    /// Every side-data entry in attachment order
    pub fn side_data_all(&self) -> Result<Vec<Arc<FrameSideData>>> {
        let (_guard, ptr) = self.lock()?;
        let (base, count) = unsafe { ((*ptr).side_data, (*ptr).nb_side_data.max(0)) };
        if base.is_null() {
            return Ok(Vec::new());
        }
        let mut views = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let view = FrameSideData::view(unsafe { *base.add(i) }, &self.children)?;
            self.children.track(&view);
            views.push(view);
        }
        Ok(views)
    }

    /// Remove every side-data entry of `kind`
    pub fn remove_side_data(&self, kind: SideDataType) -> Result<()> {
        self.restructure(|ptr| unsafe { ffi::av_frame_remove_side_data(ptr, kind.into()) })
    }

    /// The frame's channel layout
    pub fn channel_layout(&self) -> Result<Arc<ChannelLayout>> {
        let (_guard, ptr) = self.lock()?;
        let view = ChannelLayout::view(unsafe { ptr::addr_of_mut!((*ptr).ch_layout) })?;
        self.children.track(&view);
        Ok(view)
    }

    pub fn set_channel_layout(&self, layout: &ChannelLayout) -> Result<()> {
        let (_guard, ptr) = self.lock()?;
        self.children.detach_all();
        layout.copy_into(unsafe { ptr::addr_of_mut!((*ptr).ch_layout) })
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn width(&self) -> Result<i32> {
        self.read(|f| f.width)
    }

    pub fn set_width(&self, width: i32) -> Result<()> {
        self.write(|f| f.width = width)
    }

    pub fn height(&self) -> Result<i32> {
        self.read(|f| f.height)
    }

    pub fn set_height(&self, height: i32) -> Result<()> {
        self.write(|f| f.height = height)
    }

    pub fn samples(&self) -> Result<i32> {
        self.read(|f| f.nb_samples)
    }

    pub fn set_samples(&self, samples: i32) -> Result<()> {
        self.write(|f| f.nb_samples = samples)
    }

    /// Raw `AVPixelFormat` or `AVSampleFormat` value, -1 when unset
    pub fn format(&self) -> Result<i32> {
        self.read(|f| f.format)
    }

    pub fn set_pixel_format(&self, format: Pixel) -> Result<()> {
        self.write(|f| f.format = ffi::AVPixelFormat::from(format) as i32)
    }

    pub fn set_sample_format(&self, format: Sample) -> Result<()> {
        self.write(|f| f.format = ffi::AVSampleFormat::from(format) as i32)
    }

    pub fn pts(&self) -> Result<Option<i64>> {
        self.read(|f| timestamp(f.pts))
    }

    pub fn set_pts(&self, pts: Option<i64>) -> Result<()> {
        self.write(|f| f.pts = pts.unwrap_or(ffi::AV_NOPTS_VALUE))
    }

    pub fn packet_dts(&self) -> Result<Option<i64>> {
        self.read(|f| timestamp(f.pkt_dts))
    }

    pub fn best_effort_timestamp(&self) -> Result<Option<i64>> {
        self.read(|f| timestamp(f.best_effort_timestamp))
    }

    pub fn duration(&self) -> Result<i64> {
        self.read(|f| f.duration)
    }

    pub fn set_duration(&self, duration: i64) -> Result<()> {
        self.write(|f| f.duration = duration)
    }

    pub fn sample_rate(&self) -> Result<i32> {
        self.read(|f| f.sample_rate)
    }

    pub fn set_sample_rate(&self, rate: i32) -> Result<()> {
        self.write(|f| f.sample_rate = rate)
    }

    pub fn time_base(&self) -> Result<Rational> {
        self.read(|f| Rational::from(f.time_base))
    }

    pub fn set_time_base(&self, time_base: Rational) -> Result<()> {
        self.write(|f| f.time_base = time_base.into())
    }

    pub fn sample_aspect_ratio(&self) -> Result<Rational> {
        self.read(|f| Rational::from(f.sample_aspect_ratio))
    }

    pub fn set_sample_aspect_ratio(&self, ratio: Rational) -> Result<()> {
        self.write(|f| f.sample_aspect_ratio = ratio.into())
    }

    pub fn picture_type(&self) -> Result<PictureType> {
        self.read(|f| PictureType::from(f.pict_type))
    }

    pub fn set_picture_type(&self, kind: PictureType) -> Result<()> {
        self.write(|f| f.pict_type = kind.into())
    }

    pub fn quality(&self) -> Result<i32> {
        self.read(|f| f.quality)
    }

    fn flag(&self, flag: i32) -> Result<bool> {
        self.read(|f| f.flags & flag != 0)
    }

    fn set_flag(&self, flag: i32, on: bool) -> Result<()> {
        self.write(|f| {
            if on {
                f.flags |= flag;
            } else {
                f.flags &= !flag;
            }
        })
    }

    pub fn is_key(&self) -> Result<bool> {
        self.flag(FRAME_FLAG_KEY)
    }

    pub fn set_key(&self, key: bool) -> Result<()> {
        self.set_flag(FRAME_FLAG_KEY, key)
    }

    pub fn is_interlaced(&self) -> Result<bool> {
        self.flag(FRAME_FLAG_INTERLACED)
    }

    pub fn set_interlaced(&self, interlaced: bool) -> Result<()> {
        self.set_flag(FRAME_FLAG_INTERLACED, interlaced)
    }

    /// Only meaningful for interlaced frames
    pub fn is_top_field_first(&self) -> Result<bool> {
        self.flag(FRAME_FLAG_TOP_FIELD_FIRST)
    }

    pub fn set_top_field_first(&self, top_first: bool) -> Result<()> {
        self.set_flag(FRAME_FLAG_TOP_FIELD_FIRST, top_first)
    }

    /// Extra field periods to display the picture for, `repeat_pict`
    pub fn repeat_picture(&self) -> Result<i32> {
        self.read(|f| f.repeat_pict)
    }

    /// `FF_DECODE_ERROR_*` bits set by the decoder
    pub fn decode_error_flags(&self) -> Result<i32> {
        self.read(|f| f.decode_error_flags)
    }

    pub fn color_range(&self) -> Result<Range> {
        self.read(|f| Range::from(f.color_range))
    }

    pub fn set_color_range(&self, range: Range) -> Result<()> {
        self.write(|f| f.color_range = range.into())
    }

    pub fn color_primaries(&self) -> Result<Primaries> {
        self.read(|f| Primaries::from(f.color_primaries))
    }

    pub fn set_color_primaries(&self, primaries: Primaries) -> Result<()> {
        self.write(|f| f.color_primaries = primaries.into())
    }

    pub fn color_transfer_characteristic(&self) -> Result<TransferCharacteristic> {
        self.read(|f| TransferCharacteristic::from(f.color_trc))
    }

    pub fn set_color_transfer_characteristic(&self, trc: TransferCharacteristic) -> Result<()> {
        self.write(|f| f.color_trc = trc.into())
    }

    pub fn color_space(&self) -> Result<Space> {
        self.read(|f| Space::from(f.colorspace))
    }

    pub fn set_color_space(&self, space: Space) -> Result<()> {
        self.write(|f| f.colorspace = space.into())
    }

    pub fn chroma_location(&self) -> Result<ChromaLocation> {
        self.read(|f| ChromaLocation::from(f.chroma_location))
    }

    pub fn set_chroma_location(&self, location: ChromaLocation) -> Result<()> {
        self.write(|f| f.chroma_location = location.into())
    }

    pub fn line_sizes(&self) -> Result<Vec<i32>> {
        self.read(|f| f.linesize.to_vec())
    }

    pub fn crop(&self) -> Result<Crop> {
        self.read(|f| Crop {
            top: f.crop_top,
            bottom: f.crop_bottom,
            left: f.crop_left,
            right: f.crop_right,
        })
    }

    pub fn set_crop(&self, crop: Crop) -> Result<()> {
        self.write(|f| {
            f.crop_top = crop.top;
            f.crop_bottom = crop.bottom;
            f.crop_left = crop.left;
            f.crop_right = crop.right;
        })
    }

    fn release(&self) {
        let mut frame = self.frame.lock();
        self.children.detach_all();
        if let Some((mut ptr, ownership)) = frame.take() {
            resource::unregister(ptr as usize, self);
            if ownership == Ownership::Owned {
                unsafe { ffi::av_frame_free(&mut ptr) };
            }
        }
    }
}

impl Resource for Frame {
    const KIND: &'static str = "AVFrame";

    fn ownership(&self) -> Ownership {
        self.frame.lock().ownership()
    }

    fn is_freed(&self) -> bool {
        self.frame.lock().is_null()
    }

    fn free(&self) {
        self.release();
    }

    fn claim_ownership(&self) -> bool {
        self.frame.lock().claim()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frame = self.frame.lock();
        f.debug_struct("Frame")
            .field("handle", &frame.raw())
            .field("ownership", &frame.ownership())
            .finish()
    }
}

/// Lock two distinct frames in address order, returning the guards as (a, b)
fn lock_pair<'a>(
    a: &'a Frame,
    b: &'a Frame,
) -> (
    MutexGuard<'a, Native<ffi::AVFrame>>,
    MutexGuard<'a, Native<ffi::AVFrame>>,
) {
    if (a as *const Frame) < (b as *const Frame) {
        let ga = a.frame.lock();
        let gb = b.frame.lock();
        (ga, gb)
    } else {
        let gb = b.frame.lock();
        let ga = a.frame.lock();
        (ga, gb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avutil::dict::DictFlags;
    use ffmpeg_next::format::sample::Type as SampleLayout;

    fn video_frame(width: i32, height: i32) -> Arc<Frame> {
        let frame = Frame::new().unwrap();
        frame.set_pixel_format(Pixel::YUV420P).unwrap();
        frame.set_width(width).unwrap();
        frame.set_height(height).unwrap();
        frame.allocate_buffer(0).unwrap();
        frame
    }

    #[test]
    fn test_allocate_video_buffers() {
        let frame = video_frame(16, 16);
        assert!(frame.is_writable().unwrap());
        assert_eq!(frame.buffers().unwrap().len(), 3);
        assert!(frame.line_sizes().unwrap()[0] >= 16);

        let plane = frame.plane_buffer(0).unwrap().unwrap();
        assert!(Arc::ptr_eq(&plane, &frame.buffers().unwrap()[0]));
        assert_eq!(plane.ownership(), Ownership::Borrowed);
    }

    #[test]
    fn test_allocate_requires_parameters() {
        let frame = Frame::new().unwrap();
        assert!(matches!(
            frame.allocate_buffer(0),
            Err(Error::Native {
                operation: "av_frame_get_buffer",
                ..
            })
        ));
    }

    #[test]
    fn test_clone_shares_data() {
        let frame = video_frame(8, 8);
        let clone = frame.try_clone().unwrap();
        assert_eq!(clone.width().unwrap(), 8);
        assert!(!frame.is_writable().unwrap());
        assert!(clone.buffers().unwrap()[0].same_storage(&frame.buffers().unwrap()[0]));

        let view = clone.buffers().unwrap()[0].clone();
        clone.make_writable().unwrap();
        assert!(view.is_freed());
        assert!(clone.is_writable().unwrap());
        assert!(frame.is_writable().unwrap());
    }

    #[test]
    fn test_refer_to_and_unrefer() {
        let source = video_frame(8, 8);
        let frame = Frame::new().unwrap();
        frame.refer_to(&source).unwrap();
        assert_eq!(frame.height().unwrap(), 8);
        assert_eq!(source.buffers().unwrap()[0].ref_count(), 2);

        let view = frame.buffers().unwrap()[0].clone();
        frame.unrefer().unwrap();
        assert!(view.is_freed());
        assert!(matches!(view.size(), Err(Error::FreedResource("AVBuffer"))));
        assert_eq!(frame.width().unwrap(), 0);
        assert!(frame.buffers().unwrap().is_empty());
        assert_eq!(source.buffers().unwrap()[0].ref_count(), 1);

        assert!(matches!(
            source.refer_to(&source),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_move_reference() {
        let source = video_frame(8, 8);
        let frame = Frame::new().unwrap();
        let view = source.buffers().unwrap()[0].clone();
        frame.move_reference_from(&source).unwrap();

        assert!(view.is_freed());
        assert_eq!(frame.width().unwrap(), 8);
        assert_eq!(source.width().unwrap(), 0);
        assert!(source.buffers().unwrap().is_empty());
        assert_eq!(frame.buffers().unwrap()[0].ref_count(), 1);
    }

    #[test]
    fn test_copy_data() {
        let source = video_frame(8, 8);
        let target = video_frame(8, 8);
        source.buffers().unwrap()[0]
            .with_data_mut(|bytes| bytes[0] = 200)
            .unwrap();

        source.copy_to(&target).unwrap();
        assert_eq!(
            target.buffers().unwrap()[0].with_data(|b| b[0]).unwrap(),
            200
        );
        assert!(source.copy_to(&source).is_err());
    }

    #[test]
    fn test_metadata_and_properties() {
        let source = Frame::new().unwrap();
        source.set_pts(Some(42)).unwrap();
        let metadata = source.metadata().unwrap();
        metadata.set("title", Some("demo"), DictFlags::NONE).unwrap();
        assert!(Arc::ptr_eq(&metadata, &source.metadata().unwrap()));

        let target = Frame::new().unwrap();
        let stale = target.metadata().unwrap();
        source.copy_properties_to(&target).unwrap();
        assert!(stale.is_freed());
        assert_eq!(target.pts().unwrap(), Some(42));
        assert_eq!(
            target
                .metadata()
                .unwrap()
                .get_value("title", DictFlags::NONE)
                .unwrap()
                .as_deref(),
            Some("demo")
        );
    }

    #[test]
    fn test_side_data_lifecycle() {
        let frame = Frame::new().unwrap();
        let sd = frame.add_side_data(SideDataType::A53CC, 4).unwrap();
        assert_eq!(sd.size().unwrap(), 4);
        assert_eq!(sd.to_vec().unwrap(), vec![0; 4]);
        sd.with_data_mut(|b| b[1] = 5).unwrap();
        assert!(!sd.name().unwrap().is_empty());

        let again = frame.side_data(SideDataType::A53CC).unwrap().unwrap();
        assert!(Arc::ptr_eq(&sd, &again));
        assert_eq!(frame.side_data_all().unwrap().len(), 1);
        assert_eq!(again.to_vec().unwrap()[1], 5);

        frame.remove_side_data(SideDataType::A53CC).unwrap();
        assert!(sd.is_freed());
        assert!(frame.side_data(SideDataType::A53CC).unwrap().is_none());
    }

    #[test]
    fn test_side_data_children_outlive_entry_view() {
        let frame = Frame::new().unwrap();
        frame
            .add_side_data(SideDataType::A53CC, 8)
            .unwrap()
            .with_data_mut(|b| b[0] = 9)
            .unwrap();

        let buffer = frame
            .side_data(SideDataType::A53CC)
            .unwrap()
            .unwrap()
            .buffer()
            .unwrap()
            .unwrap();
        let metadata = frame
            .side_data(SideDataType::A53CC)
            .unwrap()
            .unwrap()
            .metadata()
            .unwrap();
        assert!(!buffer.is_freed());
        assert_eq!(buffer.with_data(|b| b[0]).unwrap(), 9);
        assert!(!metadata.is_freed());
        metadata.set("origin", Some("caption"), DictFlags::NONE).unwrap();

        let entry = frame.side_data(SideDataType::A53CC).unwrap().unwrap();
        assert_eq!(
            entry
                .metadata()
                .unwrap()
                .get_value("origin", DictFlags::NONE)
                .unwrap()
                .as_deref(),
            Some("caption")
        );

        frame.remove_side_data(SideDataType::A53CC).unwrap();
        assert!(entry.is_freed());
        assert!(buffer.is_freed());
        assert!(metadata.is_freed());
    }

    #[test]
    fn test_audio_frame() {
        let frame = Frame::new().unwrap();
        let stereo = ChannelLayout::from_mask(0x3).unwrap();
        frame
            .set_sample_format(Sample::F32(SampleLayout::Packed))
            .unwrap();
        frame.set_samples(64).unwrap();
        frame.set_sample_rate(48000).unwrap();
        frame.set_channel_layout(&stereo).unwrap();
        frame.allocate_buffer(0).unwrap();

        let layout = frame.channel_layout().unwrap();
        assert_eq!(layout.channel_count().unwrap(), 2);
        assert_eq!(layout.ownership(), Ownership::Borrowed);
        assert!(layout.same_as(&stereo).unwrap());
        assert!(frame.buffers().unwrap()[0].size().unwrap() >= 64 * 8);
        assert!(frame.extended_buffers().unwrap().is_empty());

        frame.unrefer().unwrap();
        assert!(layout.is_freed());
    }

    #[test]
    fn test_key_flag_and_crop() {
        let frame = Frame::new().unwrap();
        assert!(!frame.is_key().unwrap());
        frame.set_key(true).unwrap();
        assert!(frame.is_key().unwrap());
        frame.set_key(false).unwrap();
        assert!(!frame.is_key().unwrap());

        let crop = Crop {
            top: 1,
            bottom: 2,
            left: 3,
            right: 4,
        };
        frame.set_crop(crop).unwrap();
        assert_eq!(frame.crop().unwrap(), crop);
        assert_eq!(frame.pts().unwrap(), None);
    }

    #[test]
    fn test_color_and_field_properties() {
        let frame = Frame::new().unwrap();
        assert_eq!(frame.color_range().unwrap(), Range::Unspecified);
        frame.set_color_range(Range::JPEG).unwrap();
        frame.set_color_primaries(Primaries::BT709).unwrap();
        frame
            .set_color_transfer_characteristic(TransferCharacteristic::BT709)
            .unwrap();
        frame.set_color_space(Space::BT709).unwrap();
        frame.set_chroma_location(ChromaLocation::Left).unwrap();
        assert_eq!(frame.color_range().unwrap(), Range::JPEG);
        assert_eq!(frame.color_primaries().unwrap(), Primaries::BT709);
        assert_eq!(
            frame.color_transfer_characteristic().unwrap(),
            TransferCharacteristic::BT709
        );
        assert_eq!(frame.color_space().unwrap(), Space::BT709);
        assert_eq!(frame.chroma_location().unwrap(), ChromaLocation::Left);

        frame.set_interlaced(true).unwrap();
        frame.set_top_field_first(true).unwrap();
        frame.set_key(true).unwrap();
        frame.set_interlaced(false).unwrap();
        assert!(!frame.is_interlaced().unwrap());
        assert!(frame.is_top_field_first().unwrap());
        assert!(frame.is_key().unwrap());

        frame.set_picture_type(PictureType::P).unwrap();
        frame.set_sample_aspect_ratio(Rational::new(4, 3)).unwrap();
        assert_eq!(frame.picture_type().unwrap(), PictureType::P);
        assert_eq!(frame.sample_aspect_ratio().unwrap(), Rational::new(4, 3));
        assert_eq!(frame.repeat_picture().unwrap(), 0);
        assert_eq!(frame.decode_error_flags().unwrap(), 0);
    }

    #[test]
    fn test_free_detaches_views() {
        let frame = video_frame(4, 4);
        let view = frame.buffers().unwrap()[0].clone();
        frame.free();
        frame.free();
        assert!(frame.is_freed());
        assert!(view.is_freed());
        assert!(matches!(frame.width(), Err(Error::FreedResource("AVFrame"))));
    }
}
