//! Rill stream layer
//!
//! Reliable, ordered, bidirectional byte streams multiplexed over UDP
//! tunnels: the one-byte command protocol on top of the ARQ core, the
//! multi-tunnel dispatcher with its parallel-transmission policy, tunnel
//! selection, and the transport registry with dial/accept.

pub mod config;
pub mod error;
pub mod id;
pub mod selector;
pub mod signal;
pub mod stream;
pub mod transport;

pub use config::{ArqProfile, StreamConfig, TransportConfig};
pub use error::StreamError;
pub use id::StreamId;
pub use selector::{RoundRobinSelector, TunnelSelector};
pub use signal::OnceFlag;
pub use stream::{UdpStream, CLEAN_TIMEOUT, FIN, HRT, MIN_DATAGRAM, PSH, RST, SYN};
pub use transport::UdpTransport;
