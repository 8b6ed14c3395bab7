//! Stride-aware NV21 copy into device-allocated pixel buffers.
//!
//! The graphics allocator may hand out buffers whose row pitch exceeds the
//! visible width, while ring frames are packed at the source width. When
//! the pitches match, one contiguous copy does the job; otherwise each Y
//! row and each VU row is placed at its pitched offset, with the VU plane
//! starting at `stride * height` in the destination.

use std::io;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};

/// Writable view of a foreign pixel buffer, unmapped on drop.
///
/// Mappings are per capture result and must not outlive the callback:
/// leaking them would burn virtual address space at the capture rate.
struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedBuffer {
    /// # Safety
    /// `fd` must refer to a mappable buffer of at least `len` bytes that
    /// stays alive for the lifetime of the view.
    unsafe fn map_rw(fd: RawFd, len: usize) -> io::Result<Self> {
        // SAFETY: a fresh shared mapping over the caller's descriptor.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return Err(io::Error::other("mmap returned a null mapping"));
        };
        Ok(Self { ptr, len })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping covers `len` bytes and is private to us until
        // drop.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // SAFETY: exactly the region mapped in `map_rw`.
        unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
    }
}

/// Overwrite the pixel memory behind `fd` with `src`, honoring the device
/// pitch. The mapping lives only for the duration of the copy.
///
/// # Errors
/// Propagates the mmap failure; the caller abandons this buffer and the
/// vendor's pixels stay visible.
///
/// # Safety
/// `fd` must be the pixel-memory descriptor of a buffer laid out as NV21
/// with row pitch `stride`, at least `stride * height * 3 / 2` bytes long.
pub unsafe fn overwrite_nv21(
    fd: RawFd,
    src: &[u8],
    width: u32,
    height: u32,
    stride: u32,
) -> io::Result<()> {
    let len = stride as usize * height as usize * 3 / 2;
    // SAFETY: length matches the caller's buffer contract.
    let mut map = unsafe { MappedBuffer::map_rw(fd, len)? };
    copy_nv21(src, map.as_mut_slice(), width, height, stride);
    Ok(())
}

/// Copy a packed NV21 frame into a destination with row pitch `stride`.
///
/// `src` holds `width * height * 3 / 2` packed bytes; `dst` holds
/// `stride * height * 3 / 2` bytes. With equal pitches this degenerates to
/// one flat copy.
pub fn copy_nv21(src: &[u8], dst: &mut [u8], width: u32, height: u32, stride: u32) {
    let (w, h, s) = (width as usize, height as usize, stride as usize);
    debug_assert!(s >= w);
    debug_assert!(src.len() >= w * h * 3 / 2);
    debug_assert!(dst.len() >= s * h * 3 / 2);

    if s == w {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    for row in 0..h {
        dst[row * s..row * s + w].copy_from_slice(&src[row * w..(row + 1) * w]);
    }
    let (dst_vu, src_vu) = (s * h, w * h);
    for row in 0..h / 2 {
        dst[dst_vu + row * s..dst_vu + row * s + w]
            .copy_from_slice(&src[src_vu + row * w..src_vu + (row + 1) * w]);
    }
}
