//! Transport registry
//!
//! The transport owns the tunnels, demultiplexes inbound datagrams to
//! streams by their 16-byte id prefix, creates passive streams for unknown
//! ids, and hands them to `accept`. It removes streams from its registry
//! through the clean callback each stream fires once.

use crate::config::TransportConfig;
use crate::error::StreamError;
use crate::id::StreamId;
use crate::selector::TunnelSelector;
use crate::stream::{UdpStream, MIN_DATAGRAM};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rill_io::{DatagramSink, UdpTunnel};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Multiplexes streams over a shared set of UDP tunnels.
pub struct UdpTransport {
    /// Weak handle to the owning `Arc`, for callbacks and tunnel sinks.
    self_ref: Weak<UdpTransport>,
    sel: Arc<dyn TunnelSelector>,
    cfg: TransportConfig,
    streams: RwLock<HashMap<StreamId, Arc<UdpStream>>>,
    tunnels: Mutex<Vec<Arc<UdpTunnel>>>,
    accept_tx: Sender<Arc<UdpStream>>,
    accept_rx: Receiver<Arc<UdpStream>>,
}

impl UdpTransport {
    pub fn new(sel: Arc<dyn TunnelSelector>, cfg: TransportConfig) -> Arc<Self> {
        let (accept_tx, accept_rx) = bounded(cfg.accept_backlog);
        Arc::new_cyclic(|self_ref| UdpTransport {
            self_ref: self_ref.clone(),
            sel,
            cfg,
            streams: RwLock::new(HashMap::new()),
            tunnels: Mutex::new(Vec::new()),
            accept_tx,
            accept_rx,
        })
    }

    /// Bind a tunnel on `local`, start its reader routed at this
    /// transport, and register it with the selector.
    pub fn bind_tunnel(&self, local: &str) -> Result<Arc<UdpTunnel>, StreamError> {
        let addr: SocketAddr = local
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"))?;
        let tunnel = UdpTunnel::bind(addr)?;
        let demux = Arc::new(Demux(self.self_ref.clone()));
        Arc::clone(&tunnel).start(demux, MIN_DATAGRAM);
        self.sel.register(Arc::clone(&tunnel));
        self.tunnels.lock().push(Arc::clone(&tunnel));
        info!(local = %tunnel.local_addr(), "tunnel bound");
        Ok(tunnel)
    }

    fn clean_callback(&self) -> Box<dyn Fn(StreamId) + Send + Sync> {
        let weak = self.self_ref.clone();
        Box::new(move |id| {
            if let Some(transport) = weak.upgrade() {
                transport.clean(id);
            }
        })
    }

    fn clean(&self, id: StreamId) {
        if self.streams.write().remove(&id).is_some() {
            debug!(id = %id, "stream removed from registry");
        }
    }

    /// Open an active stream to `remotes`, announcing `locals` in the SYN,
    /// using the configured dial timeout.
    pub fn open(
        &self,
        locals: Vec<String>,
        remotes: Vec<String>,
    ) -> Result<Arc<UdpStream>, StreamError> {
        let timeout = self.cfg.dial_timeout;
        self.open_timeout(locals, remotes, timeout)
    }

    /// Open an active stream with an explicit dial timeout.
    pub fn open_timeout(
        &self,
        locals: Vec<String>,
        remotes: Vec<String>,
        timeout: Duration,
    ) -> Result<Arc<UdpStream>, StreamError> {
        let id = StreamId::generate();
        let stream = UdpStream::new(
            id,
            false,
            remotes,
            Arc::clone(&self.sel),
            &self.cfg.stream,
            self.clean_callback(),
        )?;
        self.streams.write().insert(id, Arc::clone(&stream));

        match stream.dial(&locals, timeout) {
            Ok(()) => Ok(stream),
            Err(err) => {
                let _ = stream.close();
                Err(err)
            }
        }
    }

    /// Wait indefinitely for an inbound stream.
    pub fn accept(&self) -> Result<Arc<UdpStream>, StreamError> {
        loop {
            match self.accept_timeout(Duration::from_secs(3600)) {
                Err(StreamError::Timeout) => continue,
                other => return other,
            }
        }
    }

    /// Wait for an inbound stream and complete its SYN processing.
    ///
    /// The pending stream's own `accept` never suspends; this retries it
    /// until the SYN has been assembled or `timeout` elapses.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Arc<UdpStream>, StreamError> {
        let deadline = Instant::now() + timeout;
        let stream = match self.accept_rx.recv_timeout(timeout) {
            Ok(stream) => stream,
            Err(RecvTimeoutError::Timeout) => return Err(StreamError::Timeout),
            Err(RecvTimeoutError::Disconnected) => return Err(StreamError::Closed),
        };

        loop {
            match stream.accept() {
                Ok(()) => return Ok(stream),
                Err(StreamError::RemoteStream) => {
                    if Instant::now() >= deadline {
                        return Err(StreamError::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => {
                    warn!(id = %stream.id(), error = %err, "accept failed");
                    return Err(err);
                }
            }
        }
    }

    /// Number of live streams in the registry.
    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Close every stream and stop every tunnel reader.
    pub fn close(&self) {
        let streams: Vec<_> = self.streams.read().values().cloned().collect();
        for stream in streams {
            let _ = stream.close();
        }
        for tunnel in self.tunnels.lock().iter() {
            tunnel.close();
        }
    }
}

/// Datagram sink the tunnels feed; holds the transport weakly so tunnel
/// reader threads never keep a dropped transport alive.
struct Demux(Weak<UdpTransport>);

impl DatagramSink for Demux {
    fn route(&self, data: &[u8], from: SocketAddr) {
        if let Some(transport) = self.0.upgrade() {
            transport.route_datagram(data, from);
        }
    }
}

impl UdpTransport {
    fn route_datagram(&self, data: &[u8], from: SocketAddr) {
        let Some(id) = StreamId::from_slice(data) else {
            return;
        };

        // Clone out of the registry so the read guard is not held across
        // stream input.
        let known = self.streams.read().get(&id).cloned();
        if let Some(stream) = known {
            stream.input(data);
            return;
        }

        // Unknown id: a peer is dialing us. Until its SYN arrives, the
        // receiving tunnel and the datagram source stand in for the
        // stream's endpoint set.
        let stream = {
            let mut streams = self.streams.write();
            if let Some(existing) = streams.get(&id) {
                Arc::clone(existing)
            } else {
                let created = UdpStream::new(
                    id,
                    true,
                    vec![from.to_string()],
                    Arc::clone(&self.sel),
                    &self.cfg.stream,
                    self.clean_callback(),
                );
                match created {
                    Ok(stream) => {
                        streams.insert(id, Arc::clone(&stream));
                        if self.accept_tx.try_send(Arc::clone(&stream)).is_err() {
                            warn!(id = %id, "accept backlog full, refusing stream");
                            streams.remove(&id);
                            let _ = stream.close();
                            return;
                        }
                        stream
                    }
                    Err(err) => {
                        debug!(id = %id, from = %from, error = %err, "failed to create passive stream");
                        return;
                    }
                }
            }
        };
        stream.input(data);
    }
}
