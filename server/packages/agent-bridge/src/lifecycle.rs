//! Invocation state machine and the teardown guard.
//!
//! Every terminal trigger (completion, failure, process exit, cancellation,
//! consumer disconnect) funnels through [`Lifecycle::close`]. Only the first
//! caller wins and performs cleanup.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Idle = 0,
    Spawning = 1,
    Streaming = 2,
    Closed = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Spawning,
            2 => Self::Streaming,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The agent reported a successful result.
    Completed,
    /// Spawn failure, fatal event or stderr, truncated output, or bad exit.
    Failed,
    /// Explicit stop requested by the caller.
    Cancelled,
    /// The outward stream was dropped by its reader.
    ConsumerGone,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::ConsumerGone => "consumer_gone",
        })
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Idle as u8),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LifecycleState::Closed
    }

    /// Moves `from` to `to`; fails if the state changed underneath, which
    /// only happens when the invocation was closed concurrently.
    pub fn advance(&self, from: LifecycleState, to: LifecycleState) -> bool {
        debug_assert!((from as u8) < (to as u8) && to != LifecycleState::Closed);
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transitions to `Closed`. Returns true for exactly one caller.
    pub fn close(&self, reason: CloseReason) -> bool {
        let previous = self.state.swap(LifecycleState::Closed as u8, Ordering::AcqRel);
        let won = previous != LifecycleState::Closed as u8;
        if won {
            tracing::debug!(
                from = ?LifecycleState::from_u8(previous),
                %reason,
                "invocation closing"
            );
        }
        won
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
