//! Suspicion timers
//!
//! A suspected node is declared dead when its timer expires. The timer starts
//! at a maximum timeout and shrinks logarithmically toward a minimum as
//! independent peers confirm the suspicion.

use std::collections::HashSet;
use std::time::{Duration, Instant};
use zkgossip_core::types::{Incarnation, NodeId};

/// Minimum suspicion timeout for a cluster of `cluster_size`.
///
/// `mult * max(1, log10(max(1, n))) * probe_interval`
pub fn suspicion_timeout(mult: u32, cluster_size: usize, probe_interval: Duration) -> Duration {
    let scale = (cluster_size.max(1) as f64).log10().max(1.0);
    probe_interval.mul_f64(f64::from(mult) * scale)
}

/// Independent confirmations needed to reach the minimum timeout.
///
/// Small clusters cannot produce enough confirmers, so they get none.
pub fn confirmations_needed(mult: u32, cluster_size: usize) -> u32 {
    let k = mult.saturating_sub(2);
    if (cluster_size as i64 - 2) < i64::from(k) {
        0
    } else {
        k
    }
}

/// Timer for one suspected node
#[derive(Debug, Clone)]
pub struct Suspicion {
    incarnation: Incarnation,
    origin: NodeId,
    confirmers: HashSet<NodeId>,
    k: u32,
    min: Duration,
    max: Duration,
    start: Instant,
    deadline: Instant,
}

impl Suspicion {
    /// Start a timer raised by `origin` at `incarnation`
    pub fn new(
        origin: NodeId,
        incarnation: Incarnation,
        k: u32,
        min: Duration,
        max: Duration,
        now: Instant,
    ) -> Self {
        let timeout = if k == 0 { min } else { max };
        Self {
            incarnation,
            origin,
            confirmers: HashSet::new(),
            k,
            min,
            max,
            start: now,
            deadline: now + timeout,
        }
    }

    /// Count a confirmation from `from`.
    ///
    /// Returns false for the origin, repeat confirmers, or once `k`
    /// confirmations are in.
    pub fn confirm(&mut self, from: &NodeId) -> bool {
        if self.confirmers.len() as u32 >= self.k || from == &self.origin {
            return false;
        }
        if !self.confirmers.insert(from.clone()) {
            return false;
        }
        self.deadline = self.start + self.timeout();
        true
    }

    fn timeout(&self) -> Duration {
        let c = self.confirmers.len() as f64;
        let frac = (c + 1.0).ln() / (f64::from(self.k) + 1.0).ln();
        let span = self.max.saturating_sub(self.min).as_secs_f64();
        let raw = self.max.as_secs_f64() - span * frac;
        Duration::from_secs_f64(raw.max(self.min.as_secs_f64()))
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmers.len() as u32
    }

    pub fn confirmations_needed(&self) -> u32 {
        self.k
    }

    /// True once `k > 0` independent confirmations arrived
    pub fn is_confirmed(&self) -> bool {
        self.k > 0 && self.confirmations() >= self.k
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}
