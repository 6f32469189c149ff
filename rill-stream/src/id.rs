//! Stream identity
//!
//! Every stream is named by a 16-byte identifier. The id is stamped into
//! the first 16 bytes of every datagram the stream emits, and the
//! receiving transport demultiplexes on it.

use std::fmt;

/// 16-byte stream identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId([u8; StreamId::SIZE]);

impl StreamId {
    /// Identifier length in bytes, the fixed prefix of every datagram.
    pub const SIZE: usize = 16;

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        StreamId(rand::random())
    }

    /// Read an identifier from the front of a datagram.
    ///
    /// Returns `None` when fewer than [`StreamId::SIZE`] bytes are given.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let mut id = [0u8; StreamId::SIZE];
        id.copy_from_slice(data.get(..StreamId::SIZE)?);
        Some(StreamId(id))
    }

    pub fn as_bytes(&self) -> &[u8; StreamId::SIZE] {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({self})")
    }
}
