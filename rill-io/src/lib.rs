//! Rill I/O layer
//!
//! UDP tunnel endpoints, the shared outbound buffer pool, and the socket
//! plumbing underneath them.

pub mod pool;
pub mod socket;
pub mod tunnel;

pub use socket::{SocketError, TunnelSocket};
pub use tunnel::{Datagram, DatagramSink, UdpTunnel};
