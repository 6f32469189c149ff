//! Tunnel selection
//!
//! A selector maps a list of remote endpoints to the tunnels that should
//! carry them, one tunnel per endpoint. The transport registers every
//! tunnel it binds; streams consult the selector at construction and when
//! a SYN replaces their endpoint set.

use parking_lot::RwLock;
use rill_io::UdpTunnel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Maps remote endpoints to tunnels.
///
/// `pick` must return exactly one tunnel per requested endpoint; any other
/// length is treated as a pick failure by the caller.
pub trait TunnelSelector: Send + Sync {
    /// Make a newly bound tunnel available for picking.
    fn register(&self, tunnel: Arc<UdpTunnel>);

    /// Choose one tunnel per remote endpoint.
    fn pick(&self, remotes: &[String]) -> Vec<Arc<UdpTunnel>>;
}

/// Round-robin selector
///
/// Hands out registered tunnels in rotation, one per requested endpoint.
#[derive(Default)]
pub struct RoundRobinSelector {
    tunnels: RwLock<Vec<Arc<UdpTunnel>>>,
    next: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TunnelSelector for RoundRobinSelector {
    fn register(&self, tunnel: Arc<UdpTunnel>) {
        self.tunnels.write().push(tunnel);
    }

    fn pick(&self, remotes: &[String]) -> Vec<Arc<UdpTunnel>> {
        let tunnels = self.tunnels.read();
        if tunnels.is_empty() {
            return Vec::new();
        }
        remotes
            .iter()
            .map(|_| {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % tunnels.len();
                Arc::clone(&tunnels[idx])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect()
    }

    #[test]
    fn test_empty_selector_picks_nothing() {
        let sel = RoundRobinSelector::new();
        assert!(sel.pick(&endpoints(2)).is_empty());
    }

    #[test]
    fn test_pick_length_matches_request() {
        let sel = RoundRobinSelector::new();
        sel.register(UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap());

        assert_eq!(sel.pick(&endpoints(1)).len(), 1);
        assert_eq!(sel.pick(&endpoints(3)).len(), 3);
    }

    #[test]
    fn test_rotation_over_registered_tunnels() {
        let sel = RoundRobinSelector::new();
        let a = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTunnel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        sel.register(Arc::clone(&a));
        sel.register(Arc::clone(&b));

        let picked = sel.pick(&endpoints(2));
        let locals: Vec<_> = picked.iter().map(|t| t.local_addr()).collect();
        assert!(locals.contains(&a.local_addr()));
        assert!(locals.contains(&b.local_addr()));
    }
}
