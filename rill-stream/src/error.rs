//! Stream error taxonomy

use thiserror::Error;

/// Errors surfaced by streams and the transport
#[derive(Error, Debug)]
pub enum StreamError {
    /// A read, write, or dial deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The local side closed the stream (or its write half, for writers).
    #[error("stream closed")]
    Closed,

    /// The peer reset the stream, or the protocol reached an
    /// unrecoverable state.
    #[error("stream reset")]
    Reset,

    /// The peer finished sending; reads are at end of stream.
    #[error("end of stream")]
    Eof,

    /// The selector did not return one tunnel per requested endpoint.
    #[error("tunnel pick failed")]
    TunnelPick,

    /// A SYN carried an empty or unresolvable endpoint list.
    #[error("invalid syn info")]
    SynInfo,

    /// An unknown command tag arrived; the stream resets.
    #[error("invalid stream flag: {0}")]
    StreamFlag(u8),

    /// Dial was invoked without any local endpoint.
    #[error("dial requires at least one local endpoint")]
    DialParam,

    /// Accept found no buffered SYN on the pending stream.
    #[error("remote stream not ready")]
    RemoteStream,

    #[error("arq error: {0}")]
    Arq(#[from] rill_arq::ArqError),

    #[error("socket error: {0}")]
    Socket(#[from] rill_io::SocketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
