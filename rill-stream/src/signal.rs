//! One-shot transition guards
//!
//! Terminal stream transitions (close, reset, FIN in either direction,
//! first SYN, dial completion) must each fire exactly once no matter how
//! many actors race toward them. `OnceFlag` is the compare-and-set latch
//! they all go through.

use std::sync::atomic::{AtomicBool, Ordering};

/// A latch that transitions from unset to set exactly once.
#[derive(Debug, Default)]
pub struct OnceFlag(AtomicBool);

impl OnceFlag {
    pub const fn new() -> Self {
        OnceFlag(AtomicBool::new(false))
    }

    /// Set the flag. Returns true for the caller that performed the
    /// transition, false for everyone after.
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fires_exactly_once() {
        let flag = OnceFlag::new();
        assert!(!flag.is_set());
        assert!(flag.fire());
        assert!(!flag.fire());
        assert!(flag.is_set());
    }

    #[test]
    fn test_single_winner_across_threads() {
        let flag = Arc::new(OnceFlag::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let flag = Arc::clone(&flag);
            handles.push(std::thread::spawn(move || flag.fire()));
        }
        let winners: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
