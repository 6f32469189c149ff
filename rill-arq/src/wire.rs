//! ARQ segment structures and serialization
//!
//! Every datagram the engine emits carries one or more segments, each with a
//! fixed 24-byte little-endian header followed by payload data. The first
//! bytes of the datagram may be reserved by the caller (see
//! [`crate::engine::ArqEngine::reserve`]) and are not touched by this module.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Size of the segment header in bytes.
pub const OVERHEAD: usize = 24;

/// Default maximum transmission unit (excluding UDP/IP headers).
pub const MTU_DEFAULT: usize = 1400;

/// Hard upper bound on the MTU.
pub const MTU_LIMIT: usize = 1500;

/// Default send window in segments.
pub const WND_SND: u32 = 32;

/// Default receive window in segments.
pub const WND_RCV: u32 = 32;

/// Minimum retransmission timeout in no-delay mode (milliseconds).
pub const RTO_NDL: u32 = 30;

/// Minimum retransmission timeout in normal mode (milliseconds).
pub const RTO_MIN: u32 = 100;

/// Initial retransmission timeout (milliseconds).
pub const RTO_DEF: u32 = 200;

/// Upper bound on the retransmission timeout (milliseconds).
pub const RTO_MAX: u32 = 60_000;

/// Transmissions of a single segment after which the link is declared dead.
pub const DEAD_LINK: u32 = 20;

/// Initial slow-start threshold in segments.
pub const THRESH_INIT: u32 = 2;

/// Minimum slow-start threshold in segments.
pub const THRESH_MIN: u32 = 2;

/// Initial window-probe interval (milliseconds).
pub const PROBE_INIT: u32 = 7_000;

/// Maximum window-probe interval (milliseconds).
pub const PROBE_LIMIT: u32 = 120_000;

/// Default flush interval (milliseconds).
pub const INTERVAL_DEF: u32 = 100;

/// Probe flag: we need to ask the peer for its window.
pub const ASK_SEND: u8 = 0b01;

/// Probe flag: we owe the peer a window advertisement.
pub const ASK_TELL: u8 = 0b10;

/// Segment commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Data push
    Push = 81,
    /// Acknowledgement
    Ack = 82,
    /// Window probe request
    WindowAsk = 83,
    /// Window advertisement
    WindowTell = 84,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            81 => Some(Command::Push),
            82 => Some(Command::Ack),
            83 => Some(Command::WindowAsk),
            84 => Some(Command::WindowTell),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Wire decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("segment shorter than header: {0} bytes")]
    TooShort(usize),

    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    #[error("declared payload length {declared} exceeds remaining {remaining} bytes")]
    Truncated { declared: usize, remaining: usize },
}

/// Segment header
///
/// Field order on the wire: conversation id, command, fragment index,
/// window advertisement, timestamp, sequence number, unacknowledged
/// sequence number, payload length. All multi-byte fields little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Conversation id
    pub conv: u32,
    /// Segment command
    pub cmd: Command,
    /// Fragment countdown (0 = final fragment of the message)
    pub frg: u8,
    /// Receive-window advertisement (segments)
    pub wnd: u16,
    /// Send timestamp (engine-local milliseconds)
    pub ts: u32,
    /// Sequence number
    pub sn: u32,
    /// First unacknowledged sequence number at the sender
    pub una: u32,
    /// Payload length in bytes
    pub len: u32,
}

impl Header {
    /// Decode a header from the front of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Header, WireError> {
        if buf.len() < OVERHEAD {
            return Err(WireError::TooShort(buf.len()));
        }

        let conv = buf.get_u32_le();
        let cmd_raw = buf.get_u8();
        let cmd = Command::from_u8(cmd_raw).ok_or(WireError::UnknownCommand(cmd_raw))?;
        let frg = buf.get_u8();
        let wnd = buf.get_u16_le();
        let ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let una = buf.get_u32_le();
        let len = buf.get_u32_le();

        if len as usize > buf.remaining() {
            return Err(WireError::Truncated {
                declared: len as usize,
                remaining: buf.remaining(),
            });
        }

        Ok(Header {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            len,
        })
    }

    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.conv);
        out.put_u8(self.cmd.as_u8());
        out.put_u8(self.frg);
        out.put_u16_le(self.wnd);
        out.put_u32_le(self.ts);
        out.put_u32_le(self.sn);
        out.put_u32_le(self.una);
        out.put_u32_le(self.len);
    }
}

/// In-memory segment
///
/// Wire fields plus the retransmission bookkeeping the engine keeps per
/// segment in its send buffer.
#[derive(Debug, Default, Clone)]
pub struct Segment {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: BytesMut,

    /// Current retransmission timeout for this segment (milliseconds)
    pub rto: u32,
    /// Number of times this segment has been transmitted
    pub xmit: u32,
    /// Engine-local time of the next (re)transmission
    pub resend_at: u32,
    /// Duplicate-ACK count since the last transmission
    pub fast_acks: u32,
}

impl Segment {
    pub fn header(&self) -> Header {
        Header {
            conv: self.conv,
            // Segments are only constructed with valid commands.
            cmd: Command::from_u8(self.cmd).unwrap_or(Command::Push),
            frg: self.frg,
            wnd: self.wnd,
            ts: self.ts,
            sn: self.sn,
            una: self.una,
            len: self.data.len() as u32,
        }
    }
}

/// Signed distance between two wrapping 32-bit counters.
///
/// Positive when `a` is ahead of `b`. Used for both sequence numbers and
/// engine timestamps.
#[inline]
pub fn diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = Header {
            conv: 1,
            cmd: Command::Push,
            frg: 2,
            wnd: 32,
            ts: 123_456,
            sn: 42,
            una: 40,
            len: 5,
        };

        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        buf.extend_from_slice(b"hello");
        assert_eq!(buf.len(), OVERHEAD + 5);

        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn test_decode_too_short() {
        let buf = [0u8; OVERHEAD - 1];
        assert_eq!(Header::decode(&buf), Err(WireError::TooShort(OVERHEAD - 1)));
    }

    #[test]
    fn test_decode_unknown_command() {
        let hdr = Header {
            conv: 1,
            cmd: Command::Ack,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: 0,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        buf[4] = 99;
        assert_eq!(Header::decode(&buf), Err(WireError::UnknownCommand(99)));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let hdr = Header {
            conv: 1,
            cmd: Command::Push,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: 10,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        buf.extend_from_slice(b"abc");
        assert_eq!(
            Header::decode(&buf),
            Err(WireError::Truncated {
                declared: 10,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_counter_diff_wraparound() {
        assert_eq!(diff(5, 3), 2);
        assert_eq!(diff(3, 5), -2);
        assert_eq!(diff(1, u32::MAX), 2);
        assert_eq!(diff(u32::MAX, 1), -2);
    }
}
