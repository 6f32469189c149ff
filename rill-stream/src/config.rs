//! Stream and transport configuration

use rill_arq::{DEAD_LINK, MTU_DEFAULT, WND_RCV, WND_SND};
use std::time::Duration;

/// Latency/throughput presets for the ARQ engine.
///
/// Each profile maps to the engine's `(nodelay, interval, resend, no_cwnd)`
/// parameters, trading bandwidth overhead for retransmission latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqProfile {
    /// Conservative: congestion-controlled, 40 ms flush cadence.
    Normal,
    /// Faster retransmission, congestion window disabled.
    Fast,
    /// Low-latency RTO handling, 20 ms cadence.
    Fast2,
    /// Lowest latency, 10 ms cadence.
    Fast3,
}

impl ArqProfile {
    /// The engine parameter set for this profile.
    pub fn params(self) -> (bool, u32, u32, bool) {
        match self {
            ArqProfile::Normal => (false, 40, 2, false),
            ArqProfile::Fast => (false, 30, 2, true),
            ArqProfile::Fast2 => (true, 20, 2, true),
            ArqProfile::Fast3 => (true, 10, 2, true),
        }
    }
}

/// Per-stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Send window in segments.
    pub send_window: u32,
    /// Receive window in segments.
    pub recv_window: u32,
    /// Maximum transmission unit, including the stream-id prefix.
    pub mtu: usize,
    /// Flush acknowledgements immediately on every input.
    pub ack_no_delay: bool,
    /// Leave flushing after writes to the update timer (bulk transfer).
    pub write_delay: bool,
    /// Transmissions of one segment after which the link is declared dead.
    pub dead_link: u32,
    /// Per-segment transmission count that engages parallel transmission.
    pub parallel_xmit: u32,
    /// How long parallel transmission persists after the last trigger.
    pub parallel_duration: Duration,
    /// Keep-alive cadence on the control plane.
    pub heartbeat_interval: Duration,
    /// ARQ latency profile.
    pub profile: ArqProfile,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            send_window: WND_SND,
            recv_window: WND_RCV,
            mtu: MTU_DEFAULT,
            ack_no_delay: false,
            write_delay: false,
            dead_link: DEAD_LINK,
            parallel_xmit: 5,
            parallel_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            profile: ArqProfile::Normal,
        }
    }
}

/// Transport-level configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default deadline for [`crate::UdpTransport::open`].
    pub dial_timeout: Duration,
    /// Pending passive streams held for accept before new ones are refused.
    pub accept_backlog: usize,
    /// Configuration applied to every stream this transport creates.
    pub stream: StreamConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            dial_timeout: Duration::from_secs(60),
            accept_backlog: 128,
            stream: StreamConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.parallel_xmit, 5);
        assert_eq!(cfg.parallel_duration, Duration::from_secs(60));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.mtu, MTU_DEFAULT);
    }

    #[test]
    fn test_profiles_tighten_cadence() {
        let (_, normal_interval, _, _) = ArqProfile::Normal.params();
        let (_, fast3_interval, _, _) = ArqProfile::Fast3.params();
        assert!(fast3_interval < normal_interval);
    }
}
