//! Codec contexts (`AVCodecContext`)
//!
//! The send/receive calls here are synchronous and map EAGAIN/EOF to
//! `Ok(false)`. [`crate::threading::CodecWorker`] drives them from a
//! dedicated thread.

use std::ptr;
use std::sync::Arc;

use ffmpeg_next::codec::Id;
use ffmpeg_next::ffi;
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::util::media::Type as MediaType;
use ffmpeg_next::Rational;
use parking_lot::{Mutex, MutexGuard};

use super::codec::Codec;
use super::packet::Packet;
use crate::avutil::channel_layout::ChannelLayout;
use crate::avutil::class::ClassDescriptor;
use crate::avutil::dict::Dictionary;
use crate::avutil::frame::Frame;
use crate::config;
use crate::error::{check, check_again, Error, Result};
use crate::resource::{self, Dependents, Native, Ownership, Resource};

/// Wrapper around an `AVCodecContext` bound to one codec
pub struct CodecContext {
    context: Mutex<Native<ffi::AVCodecContext>>,
    codec: Arc<Codec>,
    children: Dependents,
}

impl CodecContext {
    /// Allocate a context for `codec` with its defaults. The thread count
    /// comes from the active [`config::BridgeConfig`].
    pub fn new(codec: &Arc<Codec>) -> Result<Arc<CodecContext>> {
        let ptr = unsafe { ffi::avcodec_alloc_context3(codec.as_ptr()) };
        if ptr.is_null() {
            return Err(Error::Allocation(Self::KIND));
        }
        unsafe { (*ptr).thread_count = config::current().codec_thread_count };
        resource::wrap(ptr as usize, Ownership::Owned, || CodecContext {
            context: Mutex::new(Native::new(ptr, Ownership::Owned)),
            codec: codec.clone(),
            children: Dependents::default(),
        })
    }

    pub fn codec(&self) -> Arc<Codec> {
        self.codec.clone()
    }

    /// Class of `AVCodecContext` itself, shared by every context
    pub fn class() -> Result<Arc<ClassDescriptor>> {
        ClassDescriptor::view(unsafe { ffi::avcodec_get_class() })
    }

    fn lock(
        &self,
    ) -> Result<(
        MutexGuard<'_, Native<ffi::AVCodecContext>>,
        *mut ffi::AVCodecContext,
    )> {
        let guard = self.context.lock();
        let ptr = guard.get(Self::KIND)?;
        Ok((guard, ptr))
    }

    fn read<R>(&self, f: impl FnOnce(&ffi::AVCodecContext) -> R) -> Result<R> {
        let (_guard, ptr) = self.lock()?;
        Ok(f(unsafe { &*ptr }))
    }

    fn write(&self, f: impl FnOnce(&mut ffi::AVCodecContext)) -> Result<()> {
        let (_guard, ptr) = self.lock()?;
        f(unsafe { &mut *ptr });
        Ok(())
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    pub fn codec_type(&self) -> Result<MediaType> {
        self.read(|c| MediaType::from(c.codec_type))
    }

    pub fn codec_id(&self) -> Result<Id> {
        self.read(|c| Id::from(c.codec_id))
    }

    pub fn width(&self) -> Result<i32> {
        self.read(|c| c.width)
    }

    pub fn set_width(&self, width: i32) -> Result<()> {
        self.write(|c| c.width = width)
    }

    pub fn height(&self) -> Result<i32> {
        self.read(|c| c.height)
    }

    pub fn set_height(&self, height: i32) -> Result<()> {
        self.write(|c| c.height = height)
    }

    pub fn pixel_format(&self) -> Result<Pixel> {
        self.read(|c| Pixel::from(c.pix_fmt))
    }

    pub fn set_pixel_format(&self, format: Pixel) -> Result<()> {
        self.write(|c| c.pix_fmt = format.into())
    }

    pub fn sample_format(&self) -> Result<Sample> {
        self.read(|c| Sample::from(c.sample_fmt))
    }

    pub fn set_sample_format(&self, format: Sample) -> Result<()> {
        self.write(|c| c.sample_fmt = format.into())
    }

    pub fn sample_rate(&self) -> Result<i32> {
        self.read(|c| c.sample_rate)
    }

    pub fn set_sample_rate(&self, rate: i32) -> Result<()> {
        self.write(|c| c.sample_rate = rate)
    }

    pub fn time_base(&self) -> Result<Rational> {
        self.read(|c| Rational::from(c.time_base))
    }

    pub fn set_time_base(&self, time_base: Rational) -> Result<()> {
        self.write(|c| c.time_base = time_base.into())
    }

    pub fn frame_rate(&self) -> Result<Rational> {
        self.read(|c| Rational::from(c.framerate))
    }

    pub fn set_frame_rate(&self, rate: Rational) -> Result<()> {
        self.write(|c| c.framerate = rate.into())
    }

    pub fn bit_rate(&self) -> Result<i64> {
        self.read(|c| c.bit_rate)
    }

    pub fn set_bit_rate(&self, bit_rate: i64) -> Result<()> {
        self.write(|c| c.bit_rate = bit_rate)
    }

    pub fn gop_size(&self) -> Result<i32> {
        self.read(|c| c.gop_size)
    }

    pub fn set_gop_size(&self, gop_size: i32) -> Result<()> {
        self.write(|c| c.gop_size = gop_size)
    }

    pub fn thread_count(&self) -> Result<i32> {
        self.read(|c| c.thread_count)
    }

    pub fn set_thread_count(&self, count: i32) -> Result<()> {
        self.write(|c| c.thread_count = count)
    }

    /// Samples per audio frame the encoder expects, 0 when unrestricted
    pub fn frame_size(&self) -> Result<i32> {
        self.read(|c| c.frame_size)
    }

    /// Borrowed view of the context's channel layout
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
    // Lifecycle
    // =========================================================================

    /// Open the codec. Options it consumes are removed from `options`;
    /// the ones left over were not recognised.
    pub fn open(&self, options: Option<&Dictionary>) -> Result<()> {
        let (_guard, ptr) = self.lock()?;
        let codec = self.codec.as_ptr();
        let code = match options {
            Some(options) => {
                options.with_slot(|slot| unsafe { ffi::avcodec_open2(ptr, codec, slot) })?
            }
            None => unsafe { ffi::avcodec_open2(ptr, codec, ptr::null_mut()) },
        };
        check(code, "avcodec_open2")?;
        log::debug!(
            "Opened codec context {:p} ({})",
            ptr,
            self.codec.name().unwrap_or_default()
        );
        Ok(())
    }

    pub fn is_open(&self) -> Result<bool> {
        let (_guard, ptr) = self.lock()?;
        Ok(unsafe { ffi::avcodec_is_open(ptr) } != 0)
    }

    /// Feed a raw frame to an encoder, `None` to start draining.
    /// Returns `false` when the encoder wants its output read first.
    pub fn send_frame(&self, frame: Option<&Frame>) -> Result<bool> {
        let (_guard, ptr) = self.lock()?;
        let code = match frame {
            Some(frame) => frame.with_ptr(|f| unsafe { ffi::avcodec_send_frame(ptr, f) })?,
            None => unsafe { ffi::avcodec_send_frame(ptr, ptr::null()) },
        };
        check_again(code, "avcodec_send_frame")
    }

    /// Fetch one encoded packet into `packet`. Returns `false` when more
    /// input is needed or the encoder is fully drained.
    pub fn receive_packet(&self, packet: &Packet) -> Result<bool> {
        let (_guard, ptr) = self.lock()?;
        let code = packet.restructure(|p| unsafe { ffi::avcodec_receive_packet(ptr, p) })?;
        check_again(code, "avcodec_receive_packet")
    }

    /// Feed a compressed packet to a decoder, `None` to start draining
    pub fn send_packet(&self, packet: Option<&Packet>) -> Result<bool> {
        let (_guard, ptr) = self.lock()?;
        let code = match packet {
            Some(packet) => packet.with_ptr(|p| unsafe { ffi::avcodec_send_packet(ptr, p) })?,
            None => unsafe { ffi::avcodec_send_packet(ptr, ptr::null()) },
        };
        check_again(code, "avcodec_send_packet")
    }

    /// Fetch one decoded frame into `frame`
    pub fn receive_frame(&self, frame: &Frame) -> Result<bool> {
        let (_guard, ptr) = self.lock()?;
        let code = frame.restructure(|f| unsafe { ffi::avcodec_receive_frame(ptr, f) })?;
        check_again(code, "avcodec_receive_frame")
    }

    /// Reset internal state, dropping buffered frames or packets
    pub fn flush(&self) -> Result<()> {
        let (_guard, ptr) = self.lock()?;
        unsafe { ffi::avcodec_flush_buffers(ptr) };
        Ok(())
    }

    fn release(&self) {
        let mut context = self.context.lock();
        self.children.detach_all();
        if let Some((mut ptr, ownership)) = context.take() {
            resource::unregister(ptr as usize, self);
            if ownership == Ownership::Owned {
                unsafe { ffi::avcodec_free_context(&mut ptr) };
            }
            log::debug!("Released codec context ({:?})", ownership);
        }
    }
}

impl Resource for CodecContext {
    const KIND: &'static str = "AVCodecContext";

    fn ownership(&self) -> Ownership {
        self.context.lock().ownership()
    }

    fn is_freed(&self) -> bool {
        self.context.lock().is_null()
    }

    fn free(&self) {
        self.release();
    }

    fn claim_ownership(&self) -> bool {
        self.context.lock().claim()
    }
}

impl Drop for CodecContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CodecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("handle", &self.context.lock().raw())
            .field("codec", &self.codec)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::avutil::dict::DictFlags;

    pub(crate) const WIDTH: i32 = 16;
    pub(crate) const HEIGHT: i32 = 16;

    /// An opened rawvideo encoder, or `None` when libavcodec lacks it
    pub(crate) fn rawvideo_encoder() -> Option<Arc<CodecContext>> {
        let codec = Codec::find_encoder(Id::RAWVIDEO).ok()?;
        let context = CodecContext::new(&codec).unwrap();
        context.set_width(WIDTH).unwrap();
        context.set_height(HEIGHT).unwrap();
        context.set_pixel_format(Pixel::YUV420P).unwrap();
        context.set_time_base(Rational::new(1, 25)).unwrap();
        context.open(None).unwrap();
        Some(context)
    }

    pub(crate) fn video_frame(pts: i64) -> Arc<Frame> {
        let frame = Frame::new().unwrap();
        frame.set_pixel_format(Pixel::YUV420P).unwrap();
        frame.set_width(WIDTH).unwrap();
        frame.set_height(HEIGHT).unwrap();
        frame.allocate_buffer(0).unwrap();
        frame.set_pts(Some(pts)).unwrap();
        frame
    }

    #[test]
    fn test_parameters() {
        let Ok(codec) = Codec::find_encoder(Id::RAWVIDEO) else {
            return;
        };
        let context = CodecContext::new(&codec).unwrap();
        assert_eq!(context.codec_type().unwrap(), MediaType::Video);
        assert_eq!(context.codec_id().unwrap(), Id::RAWVIDEO);
        assert_eq!(
            context.thread_count().unwrap(),
            config::current().codec_thread_count
        );
        context.set_bit_rate(1000).unwrap();
        context.set_gop_size(12).unwrap();
        assert_eq!(context.bit_rate().unwrap(), 1000);
        assert_eq!(context.gop_size().unwrap(), 12);
        assert!(!context.is_open().unwrap());
        assert!(Arc::ptr_eq(&context.codec(), &codec));
    }

    #[test]
    fn test_encode_synchronously() {
        let Some(encoder) = rawvideo_encoder() else {
            return;
        };
        assert!(encoder.is_open().unwrap());

        let packet = Packet::new().unwrap();
        assert!(!encoder.receive_packet(&packet).unwrap());

        assert!(encoder.send_frame(Some(&video_frame(7))).unwrap());
        assert!(encoder.receive_packet(&packet).unwrap());
        assert_eq!(packet.size().unwrap(), (WIDTH * HEIGHT * 3 / 2) as usize);
        assert_eq!(packet.pts().unwrap(), Some(7));

        assert!(encoder.send_frame(None).unwrap());
        assert!(!encoder.receive_packet(&packet).unwrap());
    }

    #[test]
    fn test_decode_synchronously() {
        let Some(encoder) = rawvideo_encoder() else {
            return;
        };
        let Ok(codec) = Codec::find_decoder(Id::RAWVIDEO) else {
            return;
        };
        let packet = Packet::new().unwrap();
        encoder.send_frame(Some(&video_frame(3))).unwrap();
        assert!(encoder.receive_packet(&packet).unwrap());

        let decoder = CodecContext::new(&codec).unwrap();
        decoder.set_width(WIDTH).unwrap();
        decoder.set_height(HEIGHT).unwrap();
        decoder.set_pixel_format(Pixel::YUV420P).unwrap();
        decoder.open(None).unwrap();

        let frame = Frame::new().unwrap();
        let stale = frame.metadata().unwrap();
        assert!(decoder.send_packet(Some(&packet)).unwrap());
        assert!(decoder.receive_frame(&frame).unwrap());
        assert!(stale.is_freed());
        assert_eq!(frame.width().unwrap(), WIDTH);
        assert_eq!(frame.height().unwrap(), HEIGHT);
    }

    #[test]
    fn test_open_consumes_known_options() {
        let Ok(codec) = Codec::find_encoder(Id::RAWVIDEO) else {
            return;
        };
        let context = CodecContext::new(&codec).unwrap();
        context.set_width(WIDTH).unwrap();
        context.set_height(HEIGHT).unwrap();
        context.set_pixel_format(Pixel::YUV420P).unwrap();
        context.set_time_base(Rational::new(1, 25)).unwrap();

        let options = Dictionary::new().unwrap();
        options
            .set("threads", Some("1"), DictFlags::NONE)
            .unwrap();
        options
            .set("no_such_option", Some("1"), DictFlags::NONE)
            .unwrap();
        context.open(Some(&options)).unwrap();
        assert_eq!(options.keys().unwrap(), vec!["no_such_option".to_string()]);
    }

    #[test]
    fn test_channel_layout_view() {
        let Ok(codec) = Codec::find_encoder(Id::PCM_S16LE) else {
            return;
        };
        let context = CodecContext::new(&codec).unwrap();
        let stereo = ChannelLayout::from_mask(0x3).unwrap();
        let before = context.channel_layout().unwrap();
        context.set_channel_layout(&stereo).unwrap();
        assert!(before.is_freed());
        assert_eq!(context.channel_layout().unwrap().channel_count().unwrap(), 2);
    }

    #[test]
    fn test_free_and_class() {
        let Ok(codec) = Codec::find_encoder(Id::RAWVIDEO) else {
            return;
        };
        let context = CodecContext::new(&codec).unwrap();
        context.free();
        context.free();
        assert!(matches!(
            context.width(),
            Err(Error::FreedResource("AVCodecContext"))
        ));
        assert_eq!(CodecContext::class().unwrap().name().unwrap(), "AVCodecContext");
    }
}
