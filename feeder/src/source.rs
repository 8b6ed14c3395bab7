//! TCP frame source.
//!
//! The desktop streamer connects to a fixed port and pushes raw NV21
//! frames back to back, each exactly one frame-size long, with no framing
//! header. TCP gives no message boundaries, so the assembler tracks how
//! many bytes of the current frame have landed in the staging slot and
//! resumes there on the next readiness burst. A frame only becomes visible
//! to readers once every byte of it has arrived.

use log::info;
use shared::ring::{RingWriter, monotonic_ms};
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Listening half of the ingest port. At most one producer is served at a
/// time; accepting a new connection displaces the old one.
pub struct SourceListener {
    listener: TcpListener,
}

impl SourceListener {
    /// Bind the ingest port on any address with `SO_REUSEADDR`, so a
    /// restarted daemon does not trip over sockets in TIME_WAIT.
    ///
    /// # Errors
    /// A bind or listen failure here is startup-fatal for the daemon.
    pub fn bind(port: u16) -> io::Result<Self> {
        // SAFETY: plain socket syscalls; the fd is wrapped immediately so
        // every error path closes it.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let listener = unsafe { TcpListener::from_raw_fd(fd) };

        let one: libc::c_int = 1;
        // SAFETY: fd is owned by `listener`; the option value outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY,
            },
            sin_zero: [0; 8],
        };
        // SAFETY: addr is a valid sockaddr_in for the length given.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // Backlog of one: a second streamer just waits for the accept that
        // displaces the first.
        // SAFETY: fd is a bound stream socket.
        if unsafe { libc::listen(fd, 1) } < 0 {
            return Err(io::Error::last_os_error());
        }

        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    /// Port actually bound; differs from the requested one when 0 was asked.
    pub fn local_port(&self) -> io::Result<u16> {
        self.listener.local_addr().map(|a| a.port())
    }

    /// Accept one pending producer, or `None` when the readiness was
    /// spurious. The stream comes back non-blocking, ready for `pump`.
    pub fn accept(&self) -> io::Result<Option<TcpStream>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                info!("video source connected from {peer}");
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for SourceListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Byte progress of the frame currently being assembled.
#[derive(Default)]
pub struct FrameAssembly {
    received: usize,
}

impl FrameAssembly {
    /// Discard any partial frame; the next byte starts a fresh one.
    pub fn reset(&mut self) {
        self.received = 0;
    }

    pub fn received(&self) -> usize {
        self.received
    }
}

/// What `pump` left behind.
#[derive(Debug, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source has no more bytes for now; poll again later.
    Idle,
    /// The source closed or failed; drop it and await a new connection.
    Disconnected,
}

/// Drain a non-blocking source into the ring's staging slot.
///
/// Reads until the source would block, publishing a frame every time the
/// staging slot fills. A partial frame stays in the slot and in `assembly`
/// across calls; it never advances `write_index`.
pub fn pump(
    source: &mut impl Read,
    ring: &mut RingWriter,
    assembly: &mut FrameAssembly,
) -> PumpOutcome {
    loop {
        let frame_size = ring.frame_size();
        let slot = ring.staging_slot_mut();
        match source.read(&mut slot[assembly.received..]) {
            Ok(0) => return PumpOutcome::Disconnected,
            Ok(n) => {
                assembly.received += n;
                if assembly.received == frame_size {
                    ring.publish(monotonic_ms());
                    assembly.received = 0;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return PumpOutcome::Idle,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                info!("source receive error: {e}");
                return PumpOutcome::Disconnected;
            }
        }
    }
}
