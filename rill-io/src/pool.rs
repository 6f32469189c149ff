//! Shared datagram buffer pool
//!
//! Outbound datagram copies are cut from a process-wide pool of MTU-sized
//! buffers. Streams take buffers when they replicate a flushed segment and
//! the tunnel that transmits a buffer returns it afterwards.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Capacity of every pooled buffer; covers the MTU limit of the transport.
pub const BUFFER_CAPACITY: usize = 1500;

/// Buffers retained beyond this count are released to the allocator.
const MAX_POOLED: usize = 1024;

static POOL: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

/// Take an empty buffer with capacity for at least `len` bytes.
pub fn take(len: usize) -> BytesMut {
    if len <= BUFFER_CAPACITY {
        if let Some(buf) = POOL.lock().pop() {
            return buf;
        }
        BytesMut::with_capacity(BUFFER_CAPACITY)
    } else {
        BytesMut::with_capacity(len)
    }
}

/// Return a buffer to the pool.
///
/// Buffers that were not cut to the standard capacity, or that arrive while
/// the pool is full, are simply dropped.
pub fn put(mut buf: BytesMut) {
    if buf.capacity() < BUFFER_CAPACITY {
        return;
    }
    buf.clear();
    let mut pool = POOL.lock();
    if pool.len() < MAX_POOLED {
        pool.push(buf);
    }
}
