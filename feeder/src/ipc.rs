//! Descriptor rendezvous service.
//!
//! The daemon listens on a local stream socket; any client that connects
//! receives a single message consisting of one payload byte with the ring
//! descriptor attached as SCM_RIGHTS ancillary data, and the connection is
//! closed right after. Clients need nothing but a blocking connect and one
//! `recvmsg`.
//!
//! The socket is world-readable and world-writable because consumers run
//! inside arbitrary camera-client processes with no shared group.

use log::{info, warn};
use std::fs;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Listening half of the rendezvous socket.
///
/// Binds the preferred path first and falls back to the secondary path,
/// unlinking stale sockets left behind by a previous run. The bound path is
/// removed again on drop.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Bind at `primary`, or at `fallback` when the primary bind fails.
    ///
    /// # Errors
    /// Fails when neither path can be bound; that is startup-fatal for the
    /// daemon.
    pub fn bind(primary: &Path, fallback: &Path) -> io::Result<Self> {
        let (listener, path) = match Self::bind_at(primary) {
            Ok(l) => (l, primary.to_path_buf()),
            Err(e) => {
                warn!(
                    "bind {} failed ({e}); trying fallback {}",
                    primary.display(),
                    fallback.display()
                );
                (Self::bind_at(fallback)?, fallback.to_path_buf())
            }
        };
        info!("rendezvous socket listening at {}", path.display());
        Ok(Self { listener, path })
    }

    fn bind_at(path: &Path) -> io::Result<UnixListener> {
        // A previous daemon instance may have left its socket behind.
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one pending client, or `None` when the readiness was spurious.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for ControlListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Send one payload byte with `fd` attached via `sendmsg` + SCM_RIGHTS.
///
/// The kernel duplicates the descriptor into the receiving process; our
/// copy stays valid, so the same ring descriptor can be handed to any
/// number of clients one after another.
pub fn send_fd(stream: &UnixStream, fd: RawFd) -> io::Result<()> {
    let sock_fd = stream.as_raw_fd();
    let payload = [0u8; 1];
    let fd_size = size_of::<libc::c_int>();
    // CMSG_SPACE includes the cmsghdr header overhead.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // Populate the cmsghdr with SOL_SOCKET / SCM_RIGHTS and the FD value.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
    }

    let n = unsafe { libc::sendmsg(sock_fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::io::FromRawFd;
    use tempfile::tempdir;

    /// Receive one message from `sock`, extracting any SCM_RIGHTS FDs.
    unsafe fn recv_with_fd(sock: libc::c_int) -> (Vec<u8>, Vec<libc::c_int>) {
        let mut data_buf = vec![0u8; 64];
        let fd_size = size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space * 4];

        let mut iov = libc::iovec {
            iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: data_buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };
        assert!(n >= 0, "recvmsg failed: {}", io::Error::last_os_error());
        data_buf.truncate(n as usize);

        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                        / size_of::<libc::c_int>();
                    for i in 0..count {
                        fds.push(std::ptr::read_unaligned(
                            libc::CMSG_DATA(cmsg).add(i * size_of::<libc::c_int>())
                                as *const libc::c_int,
                        ));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        (data_buf, fds)
    }

    #[test]
    fn send_fd_transfers_a_working_descriptor() {
        let (sender, receiver) = UnixStream::pair().unwrap();

        // Pass the read end of a pipe; data written into the write end must
        // come out of the received (duplicated) descriptor.
        let mut pipefd: [libc::c_int; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(pipefd.as_mut_ptr()) }, 0);
        let (pipe_read, pipe_write) = (pipefd[0], pipefd[1]);

        send_fd(&sender, pipe_read).unwrap();

        let (payload, fds) = unsafe { recv_with_fd(receiver.as_raw_fd()) };
        assert_eq!(payload, vec![0u8]);
        assert_eq!(fds.len(), 1, "expected exactly one received FD");

        let msg = b"hello through SCM_RIGHTS";
        let written =
            unsafe { libc::write(pipe_write, msg.as_ptr() as *const libc::c_void, msg.len()) };
        assert_eq!(written as usize, msg.len());

        let mut received = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        let mut read_buf = vec![0u8; msg.len()];
        received.read_exact(&mut read_buf).unwrap();
        assert_eq!(&read_buf, msg);

        unsafe {
            libc::close(pipe_read);
            libc::close(pipe_write);
        }
    }

    #[test]
    fn bind_prefers_primary_and_sets_world_access() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("vcam_ipc");
        let fallback = dir.path().join("vcam_ipc_fallback");

        let listener = ControlListener::bind(&primary, &fallback).unwrap();
        assert_eq!(listener.path(), primary.as_path());

        let mode = fs::metadata(&primary).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[test]
    fn bind_falls_back_when_primary_is_unbindable() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("no-such-dir").join("vcam_ipc");
        let fallback = dir.path().join("vcam_ipc");

        let listener = ControlListener::bind(&primary, &fallback).unwrap();
        assert_eq!(listener.path(), fallback.as_path());
    }

    #[test]
    fn bound_path_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("vcam_ipc");
        let fallback = dir.path().join("vcam_ipc_fallback");
        {
            let _listener = ControlListener::bind(&primary, &fallback).unwrap();
            assert!(primary.exists());
        }
        assert!(!primary.exists());
    }
}
