//! Backing store for the frame ring.
//!
//! On device builds the segment comes from `/dev/ashmem` with the name and
//! size ioctls, which is what lets system processes recognize the region in
//! dumpsys output. Anywhere ashmem is missing (host builds, newer kernels
//! that dropped the device node) an anonymous memfd provides the same
//! contract: a sizeable descriptor that maps read-write here and can be
//! passed over a local socket and mapped read-only by a consumer.

use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use shared::constants::{ASHMEM_DEVICE, ASHMEM_NAME_LEN, ASHMEM_SET_NAME, ASHMEM_SET_PROT_MASK,
    ASHMEM_SET_SIZE};

/// Owns the shared-memory descriptor and its read-write mapping for the
/// feeder's lifetime. The descriptor is what rendezvous clients receive.
pub struct RingSegment {
    map: MmapMut,
    file: File,
}

impl RingSegment {
    /// Create and map a segment of exactly `len` bytes.
    ///
    /// # Errors
    /// Fails when neither ashmem nor memfd can provide a descriptor, or the
    /// mapping itself fails. Both are startup-fatal for the daemon.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let file = match ashmem_create(name, len) {
            Ok(f) => {
                info!("ring segment `{name}` created via {ASHMEM_DEVICE} ({len} bytes)");
                f
            }
            Err(e) => {
                debug!("ashmem unavailable ({e}); using memfd");
                let f = memfd_create(name, len)?;
                info!("ring segment `{name}` created via memfd ({len} bytes)");
                f
            }
        };

        // SAFETY: the file was just sized to `len` and nobody else maps it yet.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { map, file })
    }

    /// Descriptor handed out during rendezvous.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Manual ashmem setup: open the device, then name and size the region
/// before anyone maps it.
fn ashmem_create(name: &str, len: usize) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(ASHMEM_DEVICE)?;
    let fd = file.as_raw_fd();

    let mut name_buf = [0u8; ASHMEM_NAME_LEN];
    let n = name.len().min(ASHMEM_NAME_LEN - 1);
    name_buf[..n].copy_from_slice(&name.as_bytes()[..n]);

    // SAFETY: fd is a live ashmem descriptor; the argument buffers outlive
    // the calls.
    unsafe {
        if libc::ioctl(fd, ASHMEM_SET_NAME as _, name_buf.as_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd, ASHMEM_SET_SIZE as _, len) < 0 {
            return Err(io::Error::last_os_error());
        }
        // Cap what later mappings may request. Older kernels accept any
        // mask here, so a failure is not worth aborting over.
        let _ = libc::ioctl(
            fd,
            ASHMEM_SET_PROT_MASK as _,
            (libc::PROT_READ | libc::PROT_WRITE) as libc::c_ulong,
        );
    }
    Ok(file)
}

fn memfd_create(name: &str, len: usize) -> io::Result<File> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm name contains NUL"))?;

    // SAFETY: c_name stays alive across the call.
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just created and is owned from here on.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(len as u64)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::Mmap;
    use shared::constants::{nv21_frame_size, ring_total_size};
    use shared::ring::RingWriter;

    #[test]
    fn segment_has_requested_length() {
        let seg = RingSegment::create("vcam_test_len", 64 * 1024).unwrap();
        assert_eq!(seg.len(), 64 * 1024);
        assert!(seg.fd() >= 0);
    }

    #[test]
    fn writes_are_visible_through_a_second_mapping_of_the_fd() {
        let mut seg = RingSegment::create("vcam_test_visibility", 8192).unwrap();

        // SAFETY: within the mapping created above.
        unsafe { std::ptr::write_bytes(seg.as_mut_ptr(), 0x5C, 16) };

        let file = seg.file.try_clone().unwrap();
        // SAFETY: mapping a descriptor we own.
        let view = unsafe { Mmap::map(&file) }.unwrap();
        assert!(view[..16].iter().all(|&b| b == 0x5C));
    }

    #[test]
    fn segment_carries_an_initialized_ring() {
        let (w, h, n) = (8, 6, 3);
        let total = ring_total_size(n, nv21_frame_size(w, h));
        let mut seg = RingSegment::create("vcam_test_ring", total).unwrap();

        let writer = unsafe { RingWriter::init(seg.as_mut_ptr(), seg.len(), w, h, n) }.unwrap();
        assert_eq!(writer.write_index(), 0);
        assert_eq!(writer.header().num_frames, n);
    }
}
