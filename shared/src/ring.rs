//! Shared-memory frame ring: single producer, any number of readers.
//!
//! The segment starts with a reserved 4 KiB header page followed by
//! `num_frames` equally sized NV21 slots laid out end to end. The producer
//! fills the slot after `write_index`, then publishes it; readers only ever
//! look at the slot currently named by `write_index`. Nothing tracks
//! per-reader progress: readers take the latest frame whenever they need
//! one and may observe the same frame repeatedly.
//!
//! Concurrency model:
//! - `write_index` is release-stored by the producer after the last pixel
//!   byte of the new slot is in place, and acquire-loaded by readers, so a
//!   reader that sees index `i` also sees slot `i`'s bytes.
//! - With three slots the producer is always at least one slot away from
//!   the one readers are copying out of, so no slot is read and written at
//!   the same time.
//! - `last_update_ms` carries a CLOCK_MONOTONIC timestamp; readers use it
//!   as a dead switch and refuse frames older than [`STALE_AFTER_MS`].

use log::debug;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::constants::{HEADER_BYTES, STALE_AFTER_MS, nv21_frame_size, ring_total_size};
use crate::errors::RingError;

/// On-segment header, shared verbatim between both processes.
///
/// Field order and widths are part of the cross-process contract; everything
/// sits in the first 4 KiB page and the slot array begins at `HEADER_BYTES`.
#[repr(C)]
pub struct RingHeader {
    /// Slot holding the most recent complete frame.
    pub write_index: AtomicU32,
    pub num_frames: u32,
    pub frame_size: u32,
    pub width: u32,
    pub height: u32,
    /// CLOCK_MONOTONIC milliseconds of the last publish.
    pub last_update_ms: AtomicI64,
}

/// Milliseconds on the monotonic clock.
///
/// This is the only clock either side stamps into `last_update_ms`; wall
/// clocks jump and would trip the staleness check for no reason.
pub fn monotonic_ms() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // CLOCK_MONOTONIC with a valid timespec cannot fail.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

/// Producer half of the ring, owned by the feeder.
///
/// Holds raw pointers into a mapping the caller keeps alive; the feeder
/// owns both and drops the writer first.
pub struct RingWriter {
    header: *mut RingHeader,
    slots: *mut u8,
    num_frames: u32,
    frame_size: usize,
}

// SAFETY: the writer only holds pointers into a shared mapping; the single-
// producer contract makes moving it to another thread harmless.
unsafe impl Send for RingWriter {}

impl RingWriter {
    /// Take ownership of a fresh read-write mapping and initialize it:
    /// header zeroed then populated, every slot filled with the neutral
    /// gray frame so early readers get a defined image.
    ///
    /// # Errors
    /// Rejects mappings too small for the requested geometry and geometry
    /// that is not valid NV21 (odd height, zero dimensions, fewer than two
    /// slots).
    ///
    /// # Safety
    /// `ptr` must point to at least `len` writable bytes that outlive the
    /// writer, with no other writer attached to the same segment.
    pub unsafe fn init(
        ptr: *mut u8,
        len: usize,
        width: u32,
        height: u32,
        num_frames: u32,
    ) -> Result<Self, RingError> {
        if width == 0 || height == 0 || height % 2 != 0 {
            return Err(RingError::BadHeader {
                reason: format!("invalid NV21 geometry {width}x{height}"),
            });
        }
        if num_frames < 2 {
            return Err(RingError::BadHeader {
                reason: format!("ring needs at least 2 slots, got {num_frames}"),
            });
        }
        let frame_size = nv21_frame_size(width, height);
        let needed = ring_total_size(num_frames, frame_size);
        if len < needed {
            return Err(RingError::MappingTooSmall { needed, got: len });
        }

        // SAFETY: bounds checked above; the caller guarantees exclusive
        // write access to `ptr..ptr+len`.
        unsafe {
            ptr::write_bytes(ptr, 0, HEADER_BYTES);
            let header = ptr as *mut RingHeader;
            (*header).num_frames = num_frames;
            (*header).frame_size = frame_size as u32;
            (*header).width = width;
            (*header).height = height;

            let writer = Self {
                header,
                slots: ptr.add(HEADER_BYTES),
                num_frames,
                frame_size,
            };
            writer.fill_neutral();
            debug!(
                "ring initialized: {width}x{height}, {num_frames} slots of {frame_size} bytes"
            );
            Ok(writer)
        }
    }

    /// Paint every slot mid-gray: Y plane all zero, VU plane all 128.
    fn fill_neutral(&self) {
        let header = self.header();
        let y_len = header.width as usize * header.height as usize;
        for i in 0..self.num_frames {
            // SAFETY: slot bounds were validated in `init`.
            unsafe {
                let slot = self.slots.add(i as usize * self.frame_size);
                ptr::write_bytes(slot, 0, y_len);
                ptr::write_bytes(slot.add(y_len), 128, self.frame_size - y_len);
            }
        }
    }

    pub fn header(&self) -> &RingHeader {
        // SAFETY: the mapping outlives `self` per the `init` contract.
        unsafe { &*self.header }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn write_index(&self) -> u32 {
        self.header().write_index.load(Ordering::Acquire)
    }

    /// Index of the slot the producer fills next.
    pub fn staging_index(&self) -> u32 {
        (self.write_index() + 1) % self.num_frames
    }

    /// The slot being assembled. Safe to mutate at any time: readers never
    /// touch it until `publish` moves `write_index` onto it.
    pub fn staging_slot_mut(&mut self) -> &mut [u8] {
        let offset = self.staging_index() as usize * self.frame_size;
        // SAFETY: offset is in bounds and no reader addresses this slot.
        unsafe { std::slice::from_raw_parts_mut(self.slots.add(offset), self.frame_size) }
    }

    /// Read-only view of an arbitrary slot.
    pub fn slot(&self, index: u32) -> &[u8] {
        let offset = (index % self.num_frames) as usize * self.frame_size;
        // SAFETY: offset is in bounds.
        unsafe { std::slice::from_raw_parts(self.slots.add(offset), self.frame_size) }
    }

    /// Publish the staging slot: stamp `last_update_ms`, then advance
    /// `write_index` with release ordering so readers that observe the new
    /// index also observe the slot's pixel bytes.
    pub fn publish(&mut self, now_ms: i64) {
        let next = self.staging_index();
        let header = self.header();
        header.last_update_ms.store(now_ms, Ordering::Release);
        header.write_index.store(next, Ordering::Release);
    }
}

/// Consumer half of the ring, mapped read-only by the interposer.
#[derive(Debug)]
pub struct RingReader {
    header: *const RingHeader,
    slots: *const u8,
    num_frames: u32,
    frame_size: usize,
}

// SAFETY: read-only view of a shared mapping; every access goes through
// the acquire load on `write_index`.
unsafe impl Send for RingReader {}
unsafe impl Sync for RingReader {}

impl RingReader {
    /// Attach to an existing ring and sanity-check its header.
    ///
    /// # Errors
    /// Rejects mappings whose header does not describe a valid NV21 ring or
    /// that are shorter than the slot array the header announces.
    ///
    /// # Safety
    /// `ptr` must point to at least `len` readable bytes that stay mapped
    /// for the reader's lifetime.
    pub unsafe fn open(ptr: *const u8, len: usize) -> Result<Self, RingError> {
        if len < HEADER_BYTES {
            return Err(RingError::MappingTooSmall {
                needed: HEADER_BYTES,
                got: len,
            });
        }
        // SAFETY: at least the header page is readable per the check above.
        let header = unsafe { &*(ptr as *const RingHeader) };

        let (num_frames, frame_size) = (header.num_frames, header.frame_size as usize);
        if num_frames < 2 {
            return Err(RingError::BadHeader {
                reason: format!("num_frames = {num_frames}"),
            });
        }
        if frame_size != nv21_frame_size(header.width, header.height) {
            return Err(RingError::BadHeader {
                reason: format!(
                    "frame_size {frame_size} does not match {}x{} NV21",
                    header.width, header.height
                ),
            });
        }
        let needed = ring_total_size(num_frames, frame_size);
        if len < needed {
            return Err(RingError::MappingTooSmall { needed, got: len });
        }
        if header.write_index.load(Ordering::Acquire) >= num_frames {
            return Err(RingError::BadHeader {
                reason: "write_index out of range".into(),
            });
        }

        debug!("ring attached: {}x{}, {num_frames} slots", header.width, header.height);
        Ok(Self {
            header: ptr as *const RingHeader,
            // SAFETY: in bounds per the size check.
            slots: unsafe { ptr.add(HEADER_BYTES) },
            num_frames,
            frame_size,
        })
    }

    pub fn header(&self) -> &RingHeader {
        // SAFETY: the mapping outlives `self` per the `open` contract.
        unsafe { &*self.header }
    }

    pub fn width(&self) -> u32 {
        self.header().width
    }

    pub fn height(&self) -> u32 {
        self.header().height
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Latest complete frame: `(slot index, pixel bytes)`.
    ///
    /// The modulo guards against a corrupted producer; under the published
    /// contract `write_index` is always in range.
    pub fn latest(&self) -> (u32, &[u8]) {
        let index = self.header().write_index.load(Ordering::Acquire) % self.num_frames;
        let offset = index as usize * self.frame_size;
        // SAFETY: offset is in bounds after the modulo.
        let slot = unsafe { std::slice::from_raw_parts(self.slots.add(offset), self.frame_size) };
        (index, slot)
    }

    /// Milliseconds since the producer last published, as seen from `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.header().last_update_ms.load(Ordering::Acquire)
    }

    /// Dead switch: true when the feeder is gone or stuck and the consumer
    /// must let vendor output pass through.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        self.age_ms(now_ms) > STALE_AFTER_MS
    }
}
