//! Reliable duplex streams over UDP tunnels
//!
//! A `UdpStream` wraps one ARQ engine and layers the stream control
//! protocol on top: every ARQ payload starts with a one-byte command tag
//! (PSH, SYN, FIN, HRT, RST) followed by that command's argument. The
//! stream owns its identity, its tunnel/remote endpoint set, the
//! multi-tunnel dispatcher with the parallel-transmission policy, and an
//! updater thread driving the flush, heartbeat, and clean timers.
//!
//! One mutex serializes the engine, the endpoint arrays, the deadlines,
//! and the pending outbound batches. It is never held while blocking on an
//! event or while handing batches to a tunnel.

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::id::StreamId;
use crate::selector::TunnelSelector;
use crate::signal::OnceFlag;
use parking_lot::{Condvar, Mutex};
use rill_arq::{ArqEngine, ArqError, ArqStats, MTU_LIMIT, OVERHEAD};
use rill_io::{pool, Datagram, UdpTunnel};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Application data.
pub const PSH: u8 = b'1';
/// Dial announcement carrying the peer's endpoint list.
pub const SYN: u8 = b'2';
/// Sender will send no more application data.
pub const FIN: u8 = b'3';
/// Keep-alive heartbeat.
pub const HRT: u8 = b'4';
/// Abortive teardown.
pub const RST: u8 = b'5';

/// Drain window between reset and removal from the transport.
pub const CLEAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest datagram that can carry a stream header.
pub const MIN_DATAGRAM: usize = StreamId::SIZE + OVERHEAD;

/// Callback invoked exactly once when a stream reaches clean.
pub type CleanCallback = Box<dyn Fn(StreamId) + Send + Sync>;

/// Replication policy for outbound datagrams.
///
/// While any segment in a flush has been transmitted at least `threshold`
/// times, every datagram is copied to all tunnels, and the condition is
/// remembered for `window` past the last trigger.
struct ParallelGate {
    threshold: u32,
    window: Duration,
    expire: Option<Instant>,
}

impl ParallelGate {
    fn new(threshold: u32, window: Duration) -> Self {
        ParallelGate {
            threshold,
            window,
            expire: None,
        }
    }

    /// Number of tunnels the next datagram is replicated to.
    fn replication(&mut self, xmit_max: u32, tunnels: usize, now: Instant) -> usize {
        if xmit_max >= self.threshold {
            if self.expire.is_none() {
                debug!(xmit_max, threshold = self.threshold, "parallel transmission engaged");
            }
            self.expire = Some(now + self.window);
            return tunnels;
        }
        match self.expire {
            Some(expire) if expire > now => tunnels,
            Some(_) => {
                debug!("parallel transmission window elapsed");
                self.expire = None;
                1
            }
            None => 1,
        }
    }
}

/// State guarded by the per-stream mutex.
struct Inner {
    engine: ArqEngine,
    tunnels: Vec<Arc<UdpTunnel>>,
    remotes: Vec<SocketAddr>,
    /// Per-tunnel-index datagram queues accumulated since the last flush.
    batches: Vec<Vec<Datagram>>,
    /// Most recent assembled ARQ message, with the unread tail tracked by
    /// the cursor pair below.
    recv_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    /// Framing scratch: tag byte plus payload chunk.
    send_scratch: Vec<u8>,
    rd: Option<Instant>,
    wd: Option<Instant>,
    ack_no_delay: bool,
    write_delay: bool,
    parallel: ParallelGate,
    syn_handled: bool,
    hrt_at: Instant,
    clean_at: Option<Instant>,
}

/// A reliable, ordered, bidirectional byte stream
pub struct UdpStream {
    id: StreamId,
    accepted: bool,
    sel: Arc<dyn TunnelSelector>,
    clean_cb: CleanCallback,
    heartbeat_interval: Duration,

    inner: Mutex<Inner>,
    read_cv: Condvar,
    write_cv: Condvar,
    dial_cv: Condvar,
    update_cv: Condvar,

    close_once: OnceFlag,
    closed: OnceFlag,
    send_fin_once: OnceFlag,
    send_fin: OnceFlag,
    recv_fin: OnceFlag,
    reset_flag: OnceFlag,
    dialed: AtomicBool,
}

fn resolve(endpoint: &str) -> Result<SocketAddr, StreamError> {
    endpoint
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable endpoint").into())
}

/// Stamp the stream id over the reserved prefix of a flushed datagram and
/// queue one copy per selected tunnel index.
fn dispatch(
    id: StreamId,
    remotes: &[SocketAddr],
    parallel: &mut ParallelGate,
    batches: &mut Vec<Vec<Datagram>>,
    buf: &[u8],
    xmit_max: u32,
) {
    let copies = parallel.replication(xmit_max, remotes.len(), Instant::now());
    while batches.len() < copies {
        batches.push(Vec::new());
    }
    for (i, remote) in remotes.iter().take(copies).enumerate() {
        let mut data = pool::take(buf.len());
        data.extend_from_slice(id.as_bytes());
        data.extend_from_slice(&buf[StreamId::SIZE..]);
        batches[i].push(Datagram {
            to: *remote,
            data,
        });
    }
}

impl UdpStream {
    /// Create a stream bound to the tunnels the selector picks for
    /// `remotes`. `accepted` marks the passive side; its endpoint set is
    /// provisional until the first SYN replaces it.
    pub fn new(
        id: StreamId,
        accepted: bool,
        remotes: Vec<String>,
        sel: Arc<dyn TunnelSelector>,
        cfg: &StreamConfig,
        clean_cb: CleanCallback,
    ) -> Result<Arc<Self>, StreamError> {
        let tunnels = sel.pick(&remotes);
        if tunnels.is_empty() || tunnels.len() != remotes.len() {
            return Err(StreamError::TunnelPick);
        }

        let mut remote_addrs = Vec::with_capacity(remotes.len());
        for remote in &remotes {
            remote_addrs.push(resolve(remote)?);
        }

        let mut engine = ArqEngine::new(1);
        engine.set_mtu(cfg.mtu)?;
        engine.set_window(cfg.send_window, cfg.recv_window);
        let (nodelay, interval, resend, no_cwnd) = cfg.profile.params();
        engine.set_nodelay(nodelay, interval, resend, no_cwnd);
        engine.set_dead_link(cfg.dead_link);
        if !engine.reserve(StreamId::SIZE) {
            return Err(ArqError::InvalidMtu(cfg.mtu).into());
        }

        let now = Instant::now();
        let stream = Arc::new(UdpStream {
            id,
            accepted,
            sel,
            clean_cb,
            heartbeat_interval: cfg.heartbeat_interval,
            inner: Mutex::new(Inner {
                engine,
                tunnels,
                remotes: remote_addrs,
                batches: Vec::new(),
                recv_buf: vec![0; MTU_LIMIT],
                read_pos: 0,
                read_len: 0,
                send_scratch: vec![0; MTU_LIMIT],
                rd: None,
                wd: None,
                ack_no_delay: cfg.ack_no_delay,
                write_delay: cfg.write_delay,
                parallel: ParallelGate::new(cfg.parallel_xmit, cfg.parallel_duration),
                syn_handled: false,
                hrt_at: now + cfg.heartbeat_interval,
                clean_at: None,
            }),
            read_cv: Condvar::new(),
            write_cv: Condvar::new(),
            dial_cv: Condvar::new(),
            update_cv: Condvar::new(),
            close_once: OnceFlag::new(),
            closed: OnceFlag::new(),
            send_fin_once: OnceFlag::new(),
            send_fin: OnceFlag::new(),
            recv_fin: OnceFlag::new(),
            reset_flag: OnceFlag::new(),
            dialed: AtomicBool::new(false),
        });

        let updater = Arc::clone(&stream);
        std::thread::Builder::new()
            .name(format!("rill-stream-{id}"))
            .spawn(move || updater.update_loop())?;

        info!(id = %id, accepted, remotes = ?remotes, "new stream");
        Ok(stream)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Local address of the stream's primary tunnel.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.lock().tunnels[0].local_addr()
    }

    /// Primary remote endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.lock().remotes[0]
    }

    /// ARQ engine counters.
    pub fn stats(&self) -> ArqStats {
        self.inner.lock().engine.stats()
    }

    /// Set both read and write deadlines. `None` disables them.
    pub fn set_deadline(&self, t: Option<Instant>) {
        {
            let mut inner = self.inner.lock();
            inner.rd = t;
            inner.wd = t;
        }
        self.read_cv.notify_all();
        self.write_cv.notify_all();
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        self.inner.lock().rd = t;
        self.read_cv.notify_all();
    }

    pub fn set_write_deadline(&self, t: Option<Instant>) {
        self.inner.lock().wd = t;
        self.write_cv.notify_all();
    }

    pub fn set_window_size(&self, snd: u32, rcv: u32) {
        self.inner.lock().engine.set_window(snd, rcv);
    }

    /// Set the MTU. Rejects values beyond the transport limit.
    pub fn set_mtu(&self, mtu: usize) -> bool {
        if mtu > MTU_LIMIT {
            return false;
        }
        self.inner.lock().engine.set_mtu(mtu).is_ok()
    }

    pub fn set_ack_no_delay(&self, on: bool) {
        self.inner.lock().ack_no_delay = on;
    }

    pub fn set_write_delay(&self, on: bool) {
        self.inner.lock().write_delay = on;
    }

    pub fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, no_cwnd: bool) {
        self.inner
            .lock()
            .engine
            .set_nodelay(nodelay, interval, resend, no_cwnd);
    }

    pub fn set_dead_link(&self, dead_link: u32) {
        self.inner.lock().engine.set_dead_link(dead_link);
    }

    /// Tune the parallel-transmission trigger and persistence window.
    pub fn set_parallel(&self, xmit_threshold: u32, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.parallel.threshold = xmit_threshold;
        inner.parallel.window = duration;
    }

    fn check_recv_state(&self) -> Result<(), StreamError> {
        if self.closed.is_set() {
            return Err(StreamError::Closed);
        }
        if self.reset_flag.is_set() {
            return Err(StreamError::Reset);
        }
        if self.recv_fin.is_set() {
            return Err(StreamError::Eof);
        }
        Ok(())
    }

    fn check_send_state(&self) -> Result<(), StreamError> {
        if self.closed.is_set() {
            return Err(StreamError::Closed);
        }
        if self.reset_flag.is_set() {
            return Err(StreamError::Reset);
        }
        if self.send_fin.is_set() {
            // Half-closed for sending reads the same as closed to writers.
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Fire a one-shot flag and wake every waiter.
    ///
    /// The lock round-trip orders the transition against waiters that
    /// checked the flag but have not parked yet.
    fn fire(&self, flag: &OnceFlag) -> bool {
        if !flag.fire() {
            return false;
        }
        drop(self.inner.lock());
        self.read_cv.notify_all();
        self.write_cv.notify_all();
        self.dial_cv.notify_all();
        self.update_cv.notify_all();
        true
    }

    /// Read application bytes.
    ///
    /// Control messages consumed along the way yield `Ok(0)`; end of
    /// stream is [`StreamError::Eof`]. Pending data is drained before a
    /// remote FIN is reported, but close and reset cut reads short.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut guard = self.inner.lock();
        loop {
            if self.closed.is_set() {
                return Err(StreamError::Closed);
            }
            if self.reset_flag.is_set() {
                return Err(StreamError::Reset);
            }

            if guard.read_pos < guard.read_len {
                let inner = &mut *guard;
                let n = (inner.read_len - inner.read_pos).min(buf.len());
                buf[..n].copy_from_slice(&inner.recv_buf[inner.read_pos..inner.read_pos + n]);
                inner.read_pos += n;
                return Ok(n);
            }

            if let Some(size) = guard.engine.peek_size() {
                let inner = &mut *guard;
                if inner.recv_buf.len() < size {
                    inner.recv_buf.resize(size, 0);
                }
                inner.engine.recv(&mut inner.recv_buf[..size])?;

                if size == 0 {
                    drop(guard);
                    self.reset();
                    return Err(StreamError::StreamFlag(0));
                }
                let flag = inner.recv_buf[0];
                match flag {
                    PSH => {
                        let n = (size - 1).min(buf.len());
                        buf[..n].copy_from_slice(&inner.recv_buf[1..1 + n]);
                        inner.read_pos = 1 + n;
                        inner.read_len = size;
                        return Ok(n);
                    }
                    SYN => {
                        self.handle_syn(inner, size)?;
                        return Ok(0);
                    }
                    FIN => {
                        drop(guard);
                        if self.fire(&self.recv_fin) {
                            info!(id = %self.id, "fin received");
                        }
                        return Err(StreamError::Eof);
                    }
                    HRT => {
                        return Ok(0);
                    }
                    RST => {
                        drop(guard);
                        self.reset();
                        return Err(StreamError::Reset);
                    }
                    other => {
                        drop(guard);
                        self.reset();
                        return Err(StreamError::StreamFlag(other));
                    }
                }
            }

            if self.recv_fin.is_set() {
                return Err(StreamError::Eof);
            }

            if let Some(d) = guard.rd {
                if Instant::now() >= d {
                    return Err(StreamError::Timeout);
                }
                self.read_cv.wait_until(&mut guard, d);
            } else {
                self.read_cv.wait(&mut guard);
            }
        }
    }

    /// Write application bytes; returns how many were submitted by this
    /// call (the command tag is not counted).
    pub fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        let res = self.write_frame(PSH, buf);
        if let Err(err) = &res {
            warn!(id = %self.id, accepted = self.accepted, error = %err, "write failed");
        }
        res
    }

    /// Frame `b` under command `flag` and submit it to the engine, chunked
    /// to the MSS and bounded by the local and remote send windows.
    fn write_frame(&self, flag: u8, mut b: &[u8]) -> Result<usize, StreamError> {
        self.check_send_state()?;

        let mut total = 0usize;
        let mut guard = self.inner.lock();
        loop {
            let waiting = guard.engine.wait_snd() as u32;
            if waiting < guard.engine.send_window() && waiting < guard.engine.remote_window() {
                let inner = &mut *guard;
                loop {
                    let chunk = b.len().min(inner.engine.mss().saturating_sub(1));
                    inner.send_scratch[0] = flag;
                    inner.send_scratch[1..1 + chunk].copy_from_slice(&b[..chunk]);
                    inner.engine.submit(&inner.send_scratch[..1 + chunk])?;
                    total += chunk;
                    b = &b[chunk..];
                    if b.is_empty() {
                        break;
                    }
                    let waiting = inner.engine.wait_snd() as u32;
                    if waiting >= inner.engine.send_window()
                        || waiting >= inner.engine.remote_window()
                    {
                        break;
                    }
                }

                let waiting = guard.engine.wait_snd() as u32;
                let window_full = waiting >= guard.engine.send_window()
                    || waiting >= guard.engine.remote_window();

                if b.is_empty() {
                    let write_delay = guard.write_delay;
                    drop(guard);
                    if window_full || !write_delay {
                        self.flush(true);
                    }
                    return Ok(total);
                }
                if guard.write_delay {
                    // Bulk mode returns short rather than blocking; the
                    // update timer will drain what was submitted.
                    drop(guard);
                    return Ok(total);
                }
                drop(guard);
                self.flush(true);
                guard = self.inner.lock();
                continue;
            }

            if let Some(d) = guard.wd {
                if Instant::now() >= d {
                    return Err(StreamError::Timeout);
                }
                self.write_cv.wait_until(&mut guard, d);
            } else {
                self.write_cv.wait(&mut guard);
            }
            if self.closed.is_set() {
                return Err(StreamError::Closed);
            }
            if self.reset_flag.is_set() {
                return Err(StreamError::Reset);
            }
            if self.send_fin.is_set() {
                return Err(StreamError::Closed);
            }
        }
    }

    /// Active-side dial: announce our local endpoints and wait for the
    /// peer's first acknowledgement.
    pub fn dial(&self, locals: &[String], timeout: Duration) -> Result<(), StreamError> {
        info!(id = %self.id, accepted = self.accepted, ?locals, ?timeout, "dial");

        if self.accepted {
            return Ok(());
        }
        if locals.is_empty() {
            return Err(StreamError::DialParam);
        }

        self.write_frame(SYN, locals.join(" ").as_bytes())?;
        self.flush(true);

        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        loop {
            if self.closed.is_set() {
                return Err(StreamError::Closed);
            }
            if self.reset_flag.is_set() {
                return Err(StreamError::Reset);
            }
            if self.recv_fin.is_set() {
                return Err(StreamError::Eof);
            }
            if self.dialed.load(Ordering::Acquire) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StreamError::Timeout);
            }
            self.dial_cv.wait_until(&mut guard, deadline);
        }
    }

    /// Passive-side accept: requires the SYN to be fully assembled already
    /// and never suspends.
    pub fn accept(&self) -> Result<(), StreamError> {
        debug!(id = %self.id, "accept");
        self.check_recv_state()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let size = match inner.engine.peek_size() {
            Some(size) if size > 0 => size,
            _ => return Err(StreamError::RemoteStream),
        };
        if inner.recv_buf.len() < size {
            inner.recv_buf.resize(size, 0);
        }
        inner.engine.recv(&mut inner.recv_buf[..size])?;
        if inner.recv_buf[0] != SYN {
            return Err(StreamError::RemoteStream);
        }
        self.handle_syn(inner, size)
    }

    /// Process a SYN payload: parse the endpoint list, have the selector
    /// map it to tunnels, and atomically replace the endpoint arrays.
    /// Only the first valid SYN has effect.
    fn handle_syn(&self, inner: &mut Inner, size: usize) -> Result<(), StreamError> {
        if inner.syn_handled {
            return Ok(());
        }

        let text = std::str::from_utf8(&inner.recv_buf[1..size])
            .map_err(|_| StreamError::SynInfo)?;
        let endpoints: Vec<String> = text
            .split(' ')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        if endpoints.is_empty() {
            return Err(StreamError::SynInfo);
        }

        let tunnels = self.sel.pick(&endpoints);
        if tunnels.is_empty() || tunnels.len() != endpoints.len() {
            return Err(StreamError::SynInfo);
        }

        let mut remotes = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let addr = endpoint
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or(StreamError::SynInfo)?;
            remotes.push(addr);
        }

        inner.tunnels = tunnels;
        inner.remotes = remotes;
        inner.syn_handled = true;
        info!(id = %self.id, accepted = self.accepted, remotes = ?endpoints, "syn processed");
        Ok(())
    }

    /// Abortive close: best-effort RST, then the clean timer.
    ///
    /// The first call returns `Ok`; later calls report the stream closed.
    pub fn close(&self) -> Result<(), StreamError> {
        if !self.close_once.fire() {
            return Err(StreamError::Closed);
        }
        info!(id = %self.id, accepted = self.accepted, "close");

        self.try_send_control(RST);
        {
            let mut inner = self.inner.lock();
            if inner.clean_at.is_none() {
                inner.clean_at = Some(Instant::now() + CLEAN_TIMEOUT);
            }
        }
        self.fire(&self.closed);
        Ok(())
    }

    /// Half-close the send direction: FIN the peer and fail later writes.
    /// Idempotent; repeat calls succeed without effect.
    pub fn close_write(&self) -> Result<(), StreamError> {
        if !self.send_fin_once.fire() {
            return Ok(());
        }
        info!(id = %self.id, accepted = self.accepted, "close write");

        let _ = self.write_frame(FIN, &[]);
        self.fire(&self.send_fin);
        Ok(())
    }

    /// Internal terminal transition for remote RST, protocol errors, and
    /// dead-link detection. Releases engine buffers and arms the clean
    /// timer so the stream always leaves the registry.
    pub(crate) fn reset(&self) {
        if !self.reset_flag.fire() {
            return;
        }
        info!(id = %self.id, accepted = self.accepted, "reset");

        {
            let mut inner = self.inner.lock();
            inner.engine.release();
            if inner.clean_at.is_none() {
                inner.clean_at = Some(Instant::now() + CLEAN_TIMEOUT);
            }
        }
        self.read_cv.notify_all();
        self.write_cv.notify_all();
        self.dial_cv.notify_all();
        self.update_cv.notify_all();
    }

    /// Feed one inbound datagram (stream-id prefix included).
    pub fn input(&self, data: &[u8]) {
        if data.len() < MIN_DATAGRAM {
            return;
        }

        let mut guard = self.inner.lock();
        let ack_no_delay = guard.ack_no_delay;
        let write_delay = guard.write_delay;
        let id = self.id;

        let inner = &mut *guard;
        let Inner {
            engine,
            remotes,
            batches,
            parallel,
            ..
        } = inner;

        let result = engine.input(&data[StreamId::SIZE..], ack_no_delay, &mut |buf, xmit_max| {
            dispatch(id, remotes, parallel, batches, buf, xmit_max);
        });
        if let Err(err) = result {
            debug!(id = %id, error = %err, "input discarded");
        }

        // Bare control frames at the front of the receive queue take
        // effect without a reader attached: heartbeats are consumed, FIN
        // and RST transition the stream. Anything else — data, SYN, or an
        // unknown tag — is left for read/accept to dispatch in order.
        let mut fin_seen = false;
        let mut rst_seen = false;
        loop {
            if engine.peek_size() != Some(1) {
                break;
            }
            match engine.peek_byte() {
                Some(HRT) | Some(FIN) | Some(RST) | Some(PSH) => {}
                _ => break,
            }
            let mut tag = [0u8; 1];
            if engine.recv(&mut tag).is_err() {
                break;
            }
            match tag[0] {
                HRT => debug!(id = %id, "heartbeat received"),
                PSH => {}
                FIN => fin_seen = true,
                RST => {
                    rst_seen = true;
                    break;
                }
                _ => break,
            }
        }

        let readable = engine.peek_size().is_some();
        let dialed_now = !self.accepted
            && engine.snd_una() == 1
            && !self.dialed.swap(true, Ordering::AcqRel);
        let arq_flush = !write_delay && engine.pending_fits_window();
        drop(guard);

        if fin_seen && self.fire(&self.recv_fin) {
            info!(id = %self.id, "fin received");
        }
        if rst_seen {
            self.reset();
        }
        if readable {
            self.read_cv.notify_all();
        }
        if dialed_now {
            self.dial_cv.notify_all();
        }
        self.flush(arq_flush);
    }

    /// Drive the engine (optionally) and hand accumulated batches to their
    /// tunnels. Returns the engine's flush interval in milliseconds.
    fn flush(&self, arq_flush: bool) -> u32 {
        let mut interval = 0;
        let mut guard = self.inner.lock();

        if arq_flush {
            let id = self.id;
            let inner = &mut *guard;
            let Inner {
                engine,
                remotes,
                batches,
                parallel,
                ..
            } = inner;
            interval = engine.flush(false, &mut |buf, xmit_max| {
                dispatch(id, remotes, parallel, batches, buf, xmit_max);
            });
        }

        let waiting = guard.engine.wait_snd() as u32;
        let notify_write = waiting < guard.engine.send_window()
            && waiting < guard.engine.remote_window();

        let mut outgoing: Vec<(Arc<UdpTunnel>, Vec<Datagram>)> = Vec::new();
        {
            let inner = &mut *guard;
            for i in 0..inner.batches.len() {
                if inner.batches[i].is_empty() {
                    continue;
                }
                let batch = std::mem::take(&mut inner.batches[i]);
                if i < inner.tunnels.len() {
                    outgoing.push((Arc::clone(&inner.tunnels[i]), batch));
                } else {
                    // The endpoint set shrank since these were queued.
                    for dg in batch {
                        pool::put(dg.data);
                    }
                }
            }
        }
        drop(guard);

        if notify_write {
            self.write_cv.notify_all();
        }
        for (tunnel, batch) in outgoing {
            tunnel.send_batch(batch);
        }
        interval
    }

    /// Submit a control frame only if the send window has room now.
    fn try_send_control(&self, flag: u8) {
        let mut guard = self.inner.lock();
        let waiting = guard.engine.wait_snd() as u32;
        if waiting >= guard.engine.send_window() || waiting >= guard.engine.remote_window() {
            debug!(id = %self.id, flag, "control frame skipped, window full");
            return;
        }
        let inner = &mut *guard;
        inner.send_scratch[0] = flag;
        if inner.engine.submit(&inner.send_scratch[..1]).is_err() {
            return;
        }
        drop(guard);
        self.flush(true);
    }

    /// Timer thread: flush cadence, heartbeat, dead-link watch, clean.
    fn update_loop(self: Arc<Self>) {
        loop {
            {
                let mut guard = self.inner.lock();
                if let Some(clean_at) = guard.clean_at {
                    if Instant::now() >= clean_at {
                        guard.engine.release();
                        drop(guard);
                        info!(id = %self.id, accepted = self.accepted, "clean");
                        (self.clean_cb)(self.id);
                        return;
                    }
                }
            }

            if self.inner.lock().engine.is_dead() {
                self.reset();
            }

            let heartbeat_due = {
                let mut guard = self.inner.lock();
                let now = Instant::now();
                if now >= guard.hrt_at {
                    guard.hrt_at = now + self.heartbeat_interval;
                    true
                } else {
                    false
                }
            };
            if heartbeat_due
                && !self.closed.is_set()
                && !self.reset_flag.is_set()
                && !self.send_fin.is_set()
            {
                debug!(id = %self.id, accepted = self.accepted, "heartbeat");
                self.try_send_control(HRT);
            }

            let interval = self.flush(true);

            let mut guard = self.inner.lock();
            let mut wake = Instant::now() + Duration::from_millis(interval.max(1) as u64);
            if guard.hrt_at < wake {
                wake = guard.hrt_at;
            }
            if let Some(clean_at) = guard.clean_at {
                if clean_at < wake {
                    wake = clean_at;
                }
            }
            self.update_cv.wait_until(&mut guard, wake);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_gate_triggers_on_xmit_pressure() {
        let now = Instant::now();
        let mut gate = ParallelGate::new(5, Duration::from_secs(60));

        assert_eq!(gate.replication(1, 3, now), 1);
        assert_eq!(gate.replication(5, 3, now), 3);
        // Below threshold but inside the window: still replicated.
        assert_eq!(gate.replication(1, 3, now + Duration::from_secs(59)), 3);
        // Past the window: back to a single copy.
        assert_eq!(gate.replication(1, 3, now + Duration::from_secs(61)), 1);
    }

    #[test]
    fn test_parallel_gate_extends_window_on_retrigger() {
        let now = Instant::now();
        let mut gate = ParallelGate::new(5, Duration::from_secs(60));

        assert_eq!(gate.replication(7, 2, now), 2);
        // A second trigger 30 s in pushes the expiry out to 90 s.
        assert_eq!(gate.replication(6, 2, now + Duration::from_secs(30)), 2);
        assert_eq!(gate.replication(1, 2, now + Duration::from_secs(89)), 2);
        assert_eq!(gate.replication(1, 2, now + Duration::from_secs(91)), 1);
    }

    #[test]
    fn test_dispatch_stamps_id_and_replicates() {
        let id = StreamId::generate();
        let remotes: Vec<SocketAddr> = vec![
            "127.0.0.1:9001".parse().unwrap(),
            "127.0.0.2:9001".parse().unwrap(),
        ];
        let mut parallel = ParallelGate::new(5, Duration::from_secs(60));
        let mut batches = Vec::new();

        let mut datagram = vec![0u8; StreamId::SIZE];
        datagram.extend_from_slice(b"segment bytes");

        // Below threshold: one copy to the first tunnel only.
        dispatch(id, &remotes, &mut parallel, &mut batches, &datagram, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(&batches[0][0].data[..StreamId::SIZE], id.as_bytes());
        assert_eq!(&batches[0][0].data[StreamId::SIZE..], b"segment bytes");
        assert_eq!(batches[0][0].to, remotes[0]);

        // Retransmission pressure: every tunnel gets a copy.
        dispatch(id, &remotes, &mut parallel, &mut batches, &datagram, 5);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].to, remotes[1]);
    }
}
