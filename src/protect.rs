//! Socket protection capability
//!
//! Every upstream socket the engine opens would normally be routed back
//! through the virtual interface, looping its own traffic into the relay.
//! The embedder supplies a [`SocketProtector`] that exempts a descriptor
//! from that routing before the engine connects it.

use std::io;
use std::os::unix::io::RawFd;

/// Capability that exempts a real socket from virtual-interface routing.
///
/// Invoked on every upstream socket after creation and before `connect`.
/// Implementations wrap whatever platform facility performs the exemption;
/// the engine never assumes a specific one.
pub trait SocketProtector: Send + Sync {
    /// Exempt `fd` from being routed through the virtual interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor could not be protected; the engine
    /// treats this as a connect failure for the flow.
    fn protect(&self, fd: RawFd) -> io::Result<()>;
}

/// No-op protector for environments where upstream traffic cannot loop back
/// into the virtual interface (tests, already-isolated network namespaces).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtect;

impl SocketProtector for NoProtect {
    fn protect(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}

impl<F> SocketProtector for F
where
    F: Fn(RawFd) -> io::Result<()> + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> io::Result<()> {
        self(fd)
    }
}
