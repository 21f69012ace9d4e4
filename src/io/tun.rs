//! Virtual interface wrapper
//!
//! The engine is handed an already-open file descriptor for the virtual
//! interface: reads yield one IPv4 packet per call (datagram boundaries are
//! preserved), writes inject one packet into the device's receive path.
//! Acquiring the descriptor is the embedder's job.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// The virtual network interface, wrapping a raw descriptor.
///
/// Takes ownership of the descriptor and closes it on drop. Reads and
/// writes go through `&self` so the ingress and egress workers can share
/// one device over an `Arc` (the kernel serializes per-packet I/O on the
/// descriptor).
#[derive(Debug)]
pub struct TunDevice {
    fd: RawFd,
}

impl TunDevice {
    /// Wrap an open virtual-interface descriptor, taking ownership of it.
    pub fn new(fd: RawFd) -> TunDevice {
        TunDevice { fd }
    }

    /// Wait up to `timeout` for the device to become readable.
    ///
    /// Returns `Ok(false)` on timeout or interruption, so callers can
    /// re-check their shutdown flag and try again.
    ///
    /// # Errors
    ///
    /// Returns an error if polling the descriptor fails.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        match rc {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
            0 => Ok(false),
            _ => Ok(pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0),
        }
    }

    /// Read one packet from the device into `buf`.
    ///
    /// # Errors
    ///
    /// Returns the underlying `read(2)` error; `Ok(0)` means the device was
    /// closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    /// Write one packet to the device from `buf`.
    ///
    /// # Errors
    ///
    /// Returns the underlying `write(2)` error.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// The wrapper only carries a descriptor; per-call kernel I/O is safe to
// issue from multiple threads.
unsafe impl Send for TunDevice {}
unsafe impl Sync for TunDevice {}
