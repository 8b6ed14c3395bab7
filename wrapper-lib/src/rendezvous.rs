//! Client half of the descriptor rendezvous.
//!
//! One blocking connect to the feeder's local socket, one `recvmsg` that
//! yields a single payload byte plus the ring descriptor as SCM_RIGHTS
//! ancillary data, then the descriptor is mapped read-only and validated.
//! Any failure aborts the attempt silently; the next capture that needs
//! the ring simply tries again.

use log::{debug, info};
use memmap2::{Mmap, MmapOptions};
use shared::constants::{CONTROL_SOCKET_FALLBACK_PATH, CONTROL_SOCKET_PATH};
use shared::errors::RendezvousError;
use shared::ring::RingReader;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Read-only view of the feeder's ring, held for the process lifetime.
#[derive(Debug)]
pub struct RingConsumer {
    reader: RingReader,
    /// Owns the mapping the reader points into.
    _map: Mmap,
}

impl RingConsumer {
    pub fn reader(&self) -> &RingReader {
        &self.reader
    }
}

/// One-shot rendezvous against the well-known socket paths.
pub fn fetch(expected_len: usize) -> Result<RingConsumer, RendezvousError> {
    fetch_at(
        Path::new(CONTROL_SOCKET_PATH),
        Path::new(CONTROL_SOCKET_FALLBACK_PATH),
        expected_len,
    )
}

/// Rendezvous against explicit socket paths.
pub fn fetch_at(
    primary: &Path,
    fallback: &Path,
    expected_len: usize,
) -> Result<RingConsumer, RendezvousError> {
    let stream = connect(primary, fallback)?;
    let fd = recv_fd(&stream)?;

    // SAFETY: the descriptor was just received over SCM_RIGHTS and is
    // owned from here on.
    let file = unsafe { File::from_raw_fd(fd) };
    // SAFETY: mapping a shared segment the feeder keeps alive; the reader
    // below validates that the header's announced extent fits the mapping.
    let map = unsafe { MmapOptions::new().len(expected_len).map(&file) }
        .map_err(RendezvousError::Map)?;
    let reader = unsafe { RingReader::open(map.as_ptr(), map.len()) }?;

    info!(
        "ring mapped read-only: {}x{} NV21, {} bytes",
        reader.width(),
        reader.height(),
        expected_len
    );
    Ok(RingConsumer { reader, _map: map })
}

fn connect(primary: &Path, fallback: &Path) -> Result<UnixStream, RendezvousError> {
    match UnixStream::connect(primary) {
        Ok(s) => Ok(s),
        Err(first) => {
            debug!(
                "connect {} failed ({first}); trying {}",
                primary.display(),
                fallback.display()
            );
            UnixStream::connect(fallback).map_err(RendezvousError::Connect)
        }
    }
}

/// Receive the one-byte payload and extract the ring descriptor.
fn recv_fd(stream: &UnixStream) -> Result<RawFd, RendezvousError> {
    let mut payload = [0u8; 8];
    let fd_size = size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(RendezvousError::Recv(io::Error::last_os_error()));
    }

    let mut fd = None;
    // SAFETY: the cmsg walk stays within the control buffer recvmsg filled.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let received =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                if fd.is_none() {
                    fd = Some(received);
                } else {
                    // More descriptors than the protocol allows; do not leak them.
                    libc::close(received);
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let Some(fd) = fd else {
        return Err(RendezvousError::NoDescriptor);
    };
    if n != 1 {
        // SAFETY: fd was received above and belongs to us.
        unsafe { libc::close(fd) };
        return Err(RendezvousError::BadPayload(n as usize));
    }
    Ok(fd)
}
