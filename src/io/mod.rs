//! I/O primitives: the virtual interface wrapper and the bounded queues
//! that connect the worker loops.

mod queue;
mod tun;

pub use queue::PacketQueue;
pub use tun::TunDevice;
