//! Rill - reliable multi-tunnel stream transport over UDP
//!
//! High-level API: bind tunnels, open and accept streams.

pub use rill_arq as arq;
pub use rill_io as io;
pub use rill_stream as stream;

// Re-export commonly used types
pub use rill_stream::{
    ArqProfile, RoundRobinSelector, StreamConfig, StreamError, StreamId, TransportConfig,
    TunnelSelector, UdpStream, UdpTransport,
};
