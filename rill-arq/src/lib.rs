//! Rill ARQ Core
//!
//! This crate implements the selective-repeat reliable protocol the rill
//! transport runs over each stream: segment structures and serialization,
//! the sliding-window state machine, retransmission (timeout and fast),
//! RTT estimation, congestion control, and window probing.

pub mod engine;
pub mod wire;

pub use engine::{ArqEngine, ArqError, ArqStats};
pub use wire::{
    Command, Header, Segment, WireError, DEAD_LINK, INTERVAL_DEF, MTU_DEFAULT, MTU_LIMIT, OVERHEAD,
    RTO_DEF, RTO_MAX, RTO_MIN, RTO_NDL, WND_RCV, WND_SND,
};
