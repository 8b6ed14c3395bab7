//! Single-threaded event loop of the feeder daemon.
//!
//! One `poll` multiplexes the three readiness sources: the rendezvous
//! socket (hand the ring descriptor to a local client), the TCP listener
//! (adopt a new video source, displacing any old one), and the producer
//! socket itself (resume frame assembly). Nothing here blocks outside the
//! poll; every socket is non-blocking.
//!
//! Startup failures (segment creation, both rendezvous binds, ingest bind)
//! abort the process. Everything at runtime is transient: a broken producer
//! is dropped and the ring keeps serving its last frame until a new source
//! connects, with consumers falling back to vendor output via the
//! staleness check in the meantime.

use anyhow::Context;
use log::info;
use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;

use shared::ring::RingWriter;

use crate::config::Config;
use crate::ipc::{self, ControlListener};
use crate::shm::RingSegment;
use crate::source::{FrameAssembly, PumpOutcome, SourceListener, pump};

const POLL_TIMEOUT_MS: i32 = 500;

pub struct Feeder {
    segment: RingSegment,
    ring: RingWriter,
    control: ControlListener,
    source: SourceListener,
    producer: Option<TcpStream>,
    assembly: FrameAssembly,
}

impl Feeder {
    /// Create the ring and bring up both listeners.
    ///
    /// The segment is fully initialized (header written, slots neutral)
    /// before the rendezvous socket starts listening, so a client that
    /// receives the descriptor can map and read immediately.
    ///
    /// # Errors
    /// Any failure here is startup-fatal; the caller exits non-zero.
    pub fn bind(cfg: &Config) -> anyhow::Result<Self> {
        let total = cfg.ring_total_size();
        let mut segment = RingSegment::create(&cfg.ipc.shm_name, total)
            .context("creating the ring segment")?;
        let ring = unsafe {
            RingWriter::init(
                segment.as_mut_ptr(),
                segment.len(),
                cfg.video.width,
                cfg.video.height,
                cfg.video.num_frames,
            )
        }
        .context("initializing the ring")?;

        let control = ControlListener::bind(&cfg.ipc.socket_path, &cfg.ipc.fallback_socket_path)
            .context("binding the rendezvous socket")?;
        let source =
            SourceListener::bind(cfg.network.listen_port).context("binding the ingest port")?;
        info!(
            "feeder ready: {}x{} NV21, {} slots, ingest port {}, rendezvous {}",
            cfg.video.width,
            cfg.video.height,
            cfg.video.num_frames,
            source.local_port().unwrap_or(cfg.network.listen_port),
            control.path().display()
        );

        Ok(Self {
            segment,
            ring,
            control,
            source,
            producer: None,
            assembly: FrameAssembly::default(),
        })
    }

    /// Run until killed. Termination is by signal; the OS reclaims the
    /// segment when the last descriptor closes.
    pub fn run(mut self) -> anyhow::Result<()> {
        info!("entering event loop");
        loop {
            self.poll_once(POLL_TIMEOUT_MS)?;
        }
    }

    /// One multiplexed wait plus the handling of whatever became ready.
    /// Split out from [`run`] so the loop can be driven step by step.
    pub fn poll_once(&mut self, timeout_ms: i32) -> io::Result<()> {
        const CONTROL: usize = 0;
        const SOURCE: usize = 1;
        const PRODUCER: usize = 2;

        let mut fds = [
            libc::pollfd {
                fd: self.control.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.source.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                // A negative fd makes poll skip the slot.
                fd: self.producer.as_ref().map_or(-1, |p| p.as_raw_fd()),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: fds points to a live array of initialized pollfds.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }
        if n == 0 {
            return Ok(());
        }

        if fds[CONTROL].revents & libc::POLLIN != 0 {
            self.serve_control();
        }
        if fds[SOURCE].revents & libc::POLLIN != 0 {
            self.adopt_producer();
        }
        if fds[PRODUCER].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            self.pump_producer();
        }
        Ok(())
    }

    /// Hand the ring descriptor to one local client and hang up.
    fn serve_control(&mut self) {
        match self.control.accept() {
            Ok(Some(stream)) => {
                if let Err(e) = ipc::send_fd(&stream, self.segment.fd()) {
                    info!("rendezvous send failed: {e}");
                } else {
                    info!("handed ring descriptor to a local client");
                }
                // Dropping the stream ends the handshake.
            }
            Ok(None) => {}
            Err(e) => info!("rendezvous accept failed: {e}"),
        }
    }

    /// Adopt a newly connected video source. Only one is served at a time.
    fn adopt_producer(&mut self) {
        match self.source.accept() {
            Ok(Some(stream)) => {
                if self.producer.take().is_some() {
                    info!("displacing previous video source");
                }
                self.assembly.reset();
                self.producer = Some(stream);
            }
            Ok(None) => {}
            Err(e) => info!("ingest accept failed: {e}"),
        }
    }

    /// Resume frame assembly on the producer socket.
    fn pump_producer(&mut self) {
        let Some(stream) = self.producer.as_mut() else {
            return;
        };
        match pump(stream, &mut self.ring, &mut self.assembly) {
            PumpOutcome::Idle => {}
            PumpOutcome::Disconnected => {
                info!(
                    "video source disconnected ({} bytes of a partial frame discarded)",
                    self.assembly.received()
                );
                self.producer = None;
                self.assembly.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use memmap2::Mmap;
    use shared::constants::FRAME_SIZE;
    use shared::ring::{RingReader, monotonic_ms};
    use std::fs::File;
    use std::io::Write;
    use std::net::TcpStream;
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::thread;
    use tempfile::{TempDir, tempdir};

    fn test_feeder() -> (Feeder, TempDir) {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.ipc.socket_path = dir.path().join("vcam_ipc");
        cfg.ipc.fallback_socket_path = dir.path().join("vcam_ipc_fallback");
        cfg.ipc.shm_name = "vcam_test_segment".into();
        cfg.network.listen_port = 0;
        (Feeder::bind(&cfg).unwrap(), dir)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    /// Drive the loop until `done` reports true, asserting the index
    /// invariant after every iteration.
    fn drive(daemon: &mut Feeder, done: impl Fn(&Feeder) -> bool) {
        for _ in 0..400 {
            daemon.poll_once(25).unwrap();
            assert!(daemon.ring.write_index() < daemon.ring.header().num_frames);
            if done(daemon) {
                return;
            }
        }
        panic!("event loop did not reach the expected state");
    }

    /// Minimal SCM_RIGHTS receive: one message, payload plus first FD.
    fn recv_fd(stream: &UnixStream) -> (Vec<u8>, i32) {
        let mut data = [0u8; 8];
        let space = unsafe { libc::CMSG_SPACE(size_of::<libc::c_int>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; space];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
        assert!(n >= 0);
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        assert!(!cmsg.is_null(), "no ancillary data received");
        let fd = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int) };
        (data[..n as usize].to_vec(), fd)
    }

    #[test]
    fn rendezvous_client_sees_the_initialized_header() {
        let (mut daemon, _dir) = test_feeder();
        let path = daemon.control.path().to_path_buf();

        let client = thread::spawn(move || {
            let stream = UnixStream::connect(Path::new(&path)).unwrap();
            recv_fd(&stream)
        });
        drive(&mut daemon, |_| client.is_finished());

        let (payload, fd) = client.join().unwrap();
        assert_eq!(payload, vec![0u8]);

        // SAFETY: the received descriptor is ours now.
        let file = unsafe { File::from_raw_fd(fd) };
        let map = unsafe { Mmap::map(&file) }.unwrap();
        let reader = unsafe { RingReader::open(map.as_ptr(), map.len()) }.unwrap();

        let h = reader.header();
        assert_eq!(h.num_frames, 3);
        assert_eq!(h.frame_size, 3_110_400);
        assert_eq!(h.width, 1920);
        assert_eq!(h.height, 1080);
        assert_eq!(h.write_index.load(Ordering::Acquire), 0);
        assert_eq!(h.last_update_ms.load(Ordering::Acquire), 0);
    }

    #[test]
    fn one_full_frame_advances_the_index_once() {
        let (mut daemon, _dir) = test_feeder();
        let port = daemon.source.local_port().unwrap();
        let frame = pattern(FRAME_SIZE, 0x41);

        let t0 = monotonic_ms();
        let sent = frame.clone();
        let writer = thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(&sent).unwrap();
            s // keep the connection open past the asserts
        });
        drive(&mut daemon, |d| d.ring.write_index() == 1);
        let t1 = monotonic_ms();

        assert_eq!(daemon.ring.write_index(), 1);
        assert_eq!(daemon.ring.slot(1), &frame[..]);
        let stamp = daemon.ring.header().last_update_ms.load(Ordering::Acquire);
        assert!(stamp >= t0 && stamp <= t1, "stamp {stamp} outside [{t0}, {t1}]");
        drop(writer.join().unwrap());
    }

    #[test]
    fn chunked_delivery_reaches_the_same_state() {
        let (mut daemon, _dir) = test_feeder();
        let port = daemon.source.local_port().unwrap();
        let frame = pattern(FRAME_SIZE, 0x41);

        let sent = frame.clone();
        let writer = thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            for chunk in [&sent[..1_000_000], &sent[1_000_000..2_000_000], &sent[2_000_000..]] {
                s.write_all(chunk).unwrap();
                s.flush().unwrap();
            }
            s
        });
        drive(&mut daemon, |d| d.ring.write_index() == 1);

        assert_eq!(daemon.ring.write_index(), 1);
        assert_eq!(daemon.ring.slot(1), &frame[..]);
        drop(writer.join().unwrap());
    }

    #[test]
    fn short_frame_and_disconnect_leave_the_ring_untouched() {
        let (mut daemon, _dir) = test_feeder();
        let port = daemon.source.local_port().unwrap();

        let writer = thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(&vec![0x7F; 500_000]).unwrap();
            // Dropping the stream closes it mid-frame.
        });
        writer.join().unwrap();

        // The daemon must adopt the producer, read the partial frame, see
        // EOF, and drop the connection.
        drive(&mut daemon, |d| {
            d.assembly.received() > 0 || d.producer.is_some()
        });
        drive(&mut daemon, |d| d.producer.is_none());

        assert_eq!(daemon.ring.write_index(), 0);
        assert_eq!(
            daemon.ring.header().last_update_ms.load(Ordering::Acquire),
            0
        );
    }

    #[test]
    fn new_producer_displaces_the_old_one() {
        let (mut daemon, _dir) = test_feeder();
        let port = daemon.source.local_port().unwrap();

        let first = TcpStream::connect(("127.0.0.1", port)).unwrap();
        drive(&mut daemon, |d| d.producer.is_some());
        let old_fd = daemon.producer.as_ref().unwrap().as_raw_fd();

        let _second = TcpStream::connect(("127.0.0.1", port)).unwrap();
        drive(&mut daemon, |d| {
            d.producer
                .as_ref()
                .is_some_and(|p| p.as_raw_fd() != old_fd)
        });
        drop(first);
    }
}
