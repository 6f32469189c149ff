//! UDP tunnels
//!
//! A tunnel is one bound UDP socket usable by any number of streams. It
//! runs a single reader thread that hands every inbound datagram to a
//! [`DatagramSink`] (the transport's demultiplexer), and exposes a batched
//! output primitive for the per-stream dispatcher. A tunnel can inject
//! outbound loss at a configurable rate for testing.

use crate::pool;
use crate::socket::{SocketError, TunnelSocket};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// One outbound datagram: destination plus pooled payload buffer.
///
/// Ownership of `data` passes to the tunnel at
/// [`UdpTunnel::send_batch`]; the tunnel returns it to the pool after
/// transmission.
pub struct Datagram {
    pub to: SocketAddr,
    pub data: BytesMut,
}

/// Receiver of inbound datagrams, implemented by the transport demux.
pub trait DatagramSink: Send + Sync {
    fn route(&self, data: &[u8], from: SocketAddr);
}

/// A UDP tunnel endpoint
pub struct UdpTunnel {
    socket: TunnelSocket,
    local: SocketAddr,
    /// Outbound drop probability in permille (0 = off), for tests.
    loss_permille: AtomicU32,
    shutdown: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTunnel {
    /// Bind a tunnel to the given local address.
    pub fn bind(addr: SocketAddr) -> Result<Arc<Self>, SocketError> {
        let socket = TunnelSocket::bind(addr)?;
        let local = socket.local_addr()?;
        Ok(Arc::new(UdpTunnel {
            socket,
            local,
            loss_permille: AtomicU32::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Tune the socket read buffer.
    pub fn set_read_buffer(&self, size: usize) -> Result<(), SocketError> {
        self.socket.set_recv_buffer_size(size)
    }

    /// Tune the socket write buffer.
    pub fn set_write_buffer(&self, size: usize) -> Result<(), SocketError> {
        self.socket.set_send_buffer_size(size)
    }

    /// Drop roughly `permille`/1000 of outbound datagrams.
    pub fn simulate_loss(&self, permille: u32) {
        self.loss_permille.store(permille.min(1000), Ordering::Relaxed);
    }

    /// Start the reader thread.
    ///
    /// Every datagram of at least `min_len` bytes is handed to `sink`;
    /// shorter ones cannot carry a stream header and are dropped. Calling
    /// `start` more than once has no effect.
    pub fn start(self: Arc<Self>, sink: Arc<dyn DatagramSink>, min_len: usize) {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return;
        }

        let tunnel = Arc::clone(&self);
        let handle = std::thread::Builder::new()
            .name(format!("rill-tunnel-{}", self.local))
            .spawn(move || tunnel.read_loop(sink, min_len))
            .expect("spawn tunnel reader");
        *reader = Some(handle);
    }

    fn read_loop(&self, sink: Arc<dyn DatagramSink>, min_len: usize) {
        let mut buf = vec![0u8; pool::BUFFER_CAPACITY];
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.socket.recv_from(&mut buf) {
                Ok(Some((n, from))) => {
                    if n < min_len {
                        debug!(local = %self.local, from = %from, len = n, "runt datagram dropped");
                        continue;
                    }
                    sink.route(&buf[..n], from);
                }
                Ok(None) => {}
                Err(err) => {
                    if !self.shutdown.load(Ordering::Acquire) {
                        warn!(local = %self.local, error = %err, "tunnel receive failed");
                    }
                    return;
                }
            }
        }
    }

    /// Transmit a batch of datagrams.
    ///
    /// Buffers are owned by the tunnel from this point and go back to the
    /// shared pool whether or not transmission succeeds.
    pub fn send_batch(&self, batch: Vec<Datagram>) {
        let loss = self.loss_permille.load(Ordering::Relaxed);
        for dg in batch {
            let dropped = loss > 0 && rand::random::<u32>() % 1000 < loss;
            if !dropped {
                if let Err(err) = self.socket.send_to(&dg.data, dg.to) {
                    debug!(local = %self.local, to = %dg.to, error = %err, "send failed");
                }
            }
            pool::put(dg.data);
        }
    }

    /// Stop the reader thread. Safe to call more than once.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpTunnel {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct Collect {
        got: PlMutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl DatagramSink for Collect {
        fn route(&self, data: &[u8], from: SocketAddr) {
            self.got.lock().push((data.to_vec(), from));
        }
    }

    #[test]
    fn test_batch_output_reaches_reader() {
        let a = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let sink = Arc::new(Collect {
            got: PlMutex::new(Vec::new()),
        });
        b.clone().start(sink.clone(), 4);

        let mut data = pool::take(8);
        data.extend_from_slice(b"datagram");
        a.send_batch(vec![Datagram {
            to: b.local_addr(),
            data,
        }]);

        for _ in 0..100 {
            if !sink.got.lock().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let got = sink.got.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b"datagram");
        assert_eq!(got[0].1, a.local_addr());

        a.close();
        b.close();
    }

    #[test]
    fn test_runt_datagrams_are_dropped() {
        let a = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let sink = Arc::new(Collect {
            got: PlMutex::new(Vec::new()),
        });
        b.clone().start(sink.clone(), 16);

        let mut short = pool::take(3);
        short.extend_from_slice(b"abc");
        let mut long = pool::take(16);
        long.extend_from_slice(&[9u8; 16]);
        a.send_batch(vec![
            Datagram {
                to: b.local_addr(),
                data: short,
            },
            Datagram {
                to: b.local_addr(),
                data: long,
            },
        ]);

        for _ in 0..100 {
            if !sink.got.lock().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let got = sink.got.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, [9u8; 16]);

        a.close();
        b.close();
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let a = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        a.simulate_loss(1000);

        let sink = Arc::new(Collect {
            got: PlMutex::new(Vec::new()),
        });
        b.clone().start(sink.clone(), 1);

        for _ in 0..10 {
            let mut data = pool::take(4);
            data.extend_from_slice(b"gone");
            a.send_batch(vec![Datagram {
                to: b.local_addr(),
                data,
            }]);
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(sink.got.lock().is_empty());

        a.close();
        b.close();
    }
}
