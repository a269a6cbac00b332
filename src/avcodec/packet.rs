//! Compressed packets (`AVPacket`)

use std::ptr;
use std::sync::Arc;

use ffmpeg_next::codec::packet::side_data::Type as PacketSideDataType;
use ffmpeg_next::ffi;
use ffmpeg_next::Rational;
use parking_lot::{Mutex, MutexGuard};

use crate::avutil::buffer::Buffer;
use crate::error::{check, Error, Result};
use crate::resource::{self, Dependents, Native, Ownership, Resource};

/// `AV_PKT_FLAG_KEY`
const PACKET_FLAG_KEY: i32 = 0x0001;

/// Wrapper around an `AVPacket`
pub struct Packet {
    packet: Mutex<Native<ffi::AVPacket>>,
    children: Dependents,
}

fn timestamp(value: i64) -> Option<i64> {
    (value != ffi::AV_NOPTS_VALUE).then_some(value)
}

impl Packet {
    fn adopt(ptr: *mut ffi::AVPacket, ownership: Ownership) -> Result<Arc<Packet>> {
        resource::wrap(ptr as usize, ownership, || Packet {
            packet: Mutex::new(Native::new(ptr, ownership)),
            children: Dependents::default(),
        })
    }

    fn alloc() -> Result<*mut ffi::AVPacket> {
        let ptr = unsafe { ffi::av_packet_alloc() };
        if ptr.is_null() {
            Err(Error::Allocation(Self::KIND))
        } else {
            Ok(ptr)
        }
    }

    /// An empty packet
    pub fn new() -> Result<Arc<Packet>> {
        Self::adopt(Self::alloc()?, Ownership::Owned)
    }

    /// A packet holding a copy of `data` in a refcounted buffer
    pub fn from_data(data: &[u8]) -> Result<Arc<Packet>> {
        let size = i32::try_from(data.len()).map_err(|_| {
            Error::InvalidArgument(format!("packet of {} bytes is too large", data.len()))
        })?;
        let mut ptr = Self::alloc()?;
        let code = unsafe { ffi::av_new_packet(ptr, size) };
        if let Err(e) = check(code, "av_new_packet") {
            unsafe { ffi::av_packet_free(&mut ptr) };
            return Err(e);
        }
        if !data.is_empty() {
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), (*ptr).data, data.len()) };
        }
        Self::adopt(ptr, Ownership::Owned)
    }

    /// Wrap a packet produced elsewhere, or return its existing wrapper.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid `AVPacket`. With [`Ownership::Owned`] the
    /// wrapper frees it with `av_packet_free`.
    pub unsafe fn from_raw(ptr: *mut ffi::AVPacket, ownership: Ownership) -> Result<Arc<Packet>> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null AVPacket".into()));
        }
        Self::adopt(ptr, ownership)
    }

    pub fn as_ptr(&self) -> *mut ffi::AVPacket {
        self.packet.lock().raw()
    }

    fn lock(&self) -> Result<(MutexGuard<'_, Native<ffi::AVPacket>>, *mut ffi::AVPacket)> {
        let guard = self.packet.lock();
        let ptr = guard.get(Self::KIND)?;
        Ok((guard, ptr))
    }

    fn read<R>(&self, f: impl FnOnce(&ffi::AVPacket) -> R) -> Result<R> {
        let (_guard, ptr) = self.lock()?;
        Ok(f(unsafe { &*ptr }))
    }

    fn write(&self, f: impl FnOnce(&mut ffi::AVPacket)) -> Result<()> {
        let (_guard, ptr) = self.lock()?;
        f(unsafe { &mut *ptr });
        Ok(())
    }

    pub(crate) fn restructure<R>(&self, f: impl FnOnce(*mut ffi::AVPacket) -> R) -> Result<R> {
        let (_guard, ptr) = self.lock()?;
        self.children.detach_all();
        Ok(f(ptr))
    }

    pub(crate) fn with_ptr<R>(&self, f: impl FnOnce(*mut ffi::AVPacket) -> R) -> Result<R> {
        let (_guard, ptr) = self.lock()?;
        Ok(f(ptr))
    }

    pub fn size(&self) -> Result<usize> {
        self.read(|p| p.size.max(0) as usize)
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.read(|p| {
            if p.data.is_null() || p.size <= 0 {
                f(&[])
            } else {
                f(unsafe { std::slice::from_raw_parts(p.data, p.size as usize) })
            }
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_data(|bytes| bytes.to_vec())
    }

    pub fn pts(&self) -> Result<Option<i64>> {
        self.read(|p| timestamp(p.pts))
    }

    pub fn set_pts(&self, pts: Option<i64>) -> Result<()> {
        self.write(|p| p.pts = pts.unwrap_or(ffi::AV_NOPTS_VALUE))
    }

    pub fn dts(&self) -> Result<Option<i64>> {
        self.read(|p| timestamp(p.dts))
    }

    pub fn set_dts(&self, dts: Option<i64>) -> Result<()> {
        self.write(|p| p.dts = dts.unwrap_or(ffi::AV_NOPTS_VALUE))
    }

    pub fn duration(&self) -> Result<i64> {
        self.read(|p| p.duration)
    }

    pub fn set_duration(&self, duration: i64) -> Result<()> {
        self.write(|p| p.duration = duration)
    }

    pub fn stream_index(&self) -> Result<i32> {
        self.read(|p| p.stream_index)
    }

    pub fn set_stream_index(&self, index: i32) -> Result<()> {
        self.write(|p| p.stream_index = index)
    }

    /// `AV_PKT_FLAG_*` bits
    pub fn flags(&self) -> Result<i32> {
        self.read(|p| p.flags)
    }

    pub fn set_flags(&self, flags: i32) -> Result<()> {
        self.write(|p| p.flags = flags)
    }

    pub fn is_key(&self) -> Result<bool> {
        self.read(|p| p.flags & PACKET_FLAG_KEY != 0)
    }

    /// Byte position in the source stream, `None` when unknown
    pub fn position(&self) -> Result<Option<i64>> {
        self.read(|p| (p.pos >= 0).then_some(p.pos))
    }

    pub fn time_base(&self) -> Result<Rational> {
        self.read(|p| Rational::from(p.time_base))
    }

    pub fn set_time_base(&self, time_base: Rational) -> Result<()> {
        self.write(|p| p.time_base = time_base.into())
    }

    /// View of the buffer holding the payload. A packet whose data is not
    /// refcounted gets its own copy first.
    pub fn buffer(&self) -> Result<Option<Arc<Buffer>>> {
        let (_guard, ptr) = self.lock()?;
        if unsafe { (*ptr).buf }.is_null() && unsafe { (*ptr).size } > 0 {
            self.children.detach_all();
            check(
                unsafe { ffi::av_packet_make_refcounted(ptr) },
                "av_packet_make_refcounted",
            )?;
        }
        let buf = unsafe { (*ptr).buf };
        if buf.is_null() {
            return Ok(None);
        }
        let view = Buffer::view(buf)?;
        self.children.track(&view);
        Ok(Some(view))
    }

    /// Attach a side-data entry holding a copy of `data`
    pub fn add_side_data(&self, kind: PacketSideDataType, data: &[u8]) -> Result<()> {
        let (_guard, ptr) = self.lock()?;
        let dst = unsafe { ffi::av_packet_new_side_data(ptr, kind.into(), data.len() as _) };
        if dst.is_null() {
            return Err(Error::Allocation("AVPacketSideData"));
        }
        if !data.is_empty() {
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        }
        Ok(())
    }

    /// A copy of the first side-data entry of `kind`
    pub fn side_data(&self, kind: PacketSideDataType) -> Result<Option<Vec<u8>>> {
        let (_guard, ptr) = self.lock()?;
        let mut size = 0;
        let data = unsafe { ffi::av_packet_get_side_data(ptr, kind.into(), &mut size) };
        if data.is_null() {
            return Ok(None);
        }
        let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) };
        Ok(Some(bytes.to_vec()))
    }

    /// Drop the payload reference and reset every field
    pub fn unref(&self) -> Result<()> {
        self.restructure(|ptr| unsafe { ffi::av_packet_unref(ptr) })
    }

    /// A new owned packet referencing the same payload
    pub fn try_clone(&self) -> Result<Arc<Packet>> {
        let ptr = self.with_ptr(|ptr| unsafe { ffi::av_packet_clone(ptr) })?;
        if ptr.is_null() {
            return Err(Error::Allocation(Self::KIND));
        }
        Self::adopt(ptr, Ownership::Owned)
    }

    fn release(&self) {
        let mut packet = self.packet.lock();
        self.children.detach_all();
        if let Some((mut ptr, ownership)) = packet.take() {
            resource::unregister(ptr as usize, self);
            if ownership == Ownership::Owned {
                unsafe { ffi::av_packet_free(&mut ptr) };
            }
        }
    }
}

impl Resource for Packet {
    const KIND: &'static str = "AVPacket";

    fn ownership(&self) -> Ownership {
        self.packet.lock().ownership()
    }

    fn is_freed(&self) -> bool {
        self.packet.lock().is_null()
    }

    fn free(&self) {
        self.release();
    }

    fn claim_ownership(&self) -> bool {
        self.packet.lock().claim()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let packet = self.packet.lock();
        f.debug_struct("Packet")
            .field("handle", &packet.raw())
            .field("ownership", &packet.ownership())
            .finish()
    }
}
