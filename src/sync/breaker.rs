//! Quota circuit breaker.
//!
//! `Closed` lets remote I/O through. The first quota-class failure opens it;
//! while open every write is redirected to the fallback store and a canary
//! write probes for recovery.

use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    /// The breaker just opened. `first_report` is set once per session.
    Opened { first_report: bool },
    AlreadyOpen,
}

/// How a failed remote operation should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Tripped(Trip),
    /// Not quota-class: hand it back to the caller.
    Surface,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    state: BreakerState,
    reported: bool,
    trips: u32,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    pub fn trips(&self) -> u32 {
        self.trips
    }

    pub fn observe(&mut self, err: &RemoteError) -> Observation {
        if err.is_quota() {
            Observation::Tripped(self.trip())
        } else {
            Observation::Surface
        }
    }

    pub fn trip(&mut self) -> Trip {
        if self.is_open() {
            return Trip::AlreadyOpen;
        }
        self.state = BreakerState::Open;
        self.trips += 1;
        let first_report = !self.reported;
        self.reported = true;
        Trip::Opened { first_report }
    }

    /// Returns `false` if the breaker was already closed.
    pub fn close(&mut self) -> bool {
        if !self.is_open() {
            return false;
        }
        self.state = BreakerState::Closed;
        true
    }
}
