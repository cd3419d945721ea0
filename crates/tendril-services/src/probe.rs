//! RTT/loss estimator: a bounded window of in-flight echo probes per peer.
//!
//! Probe ids increase monotonically. The window keeps the newest `cap`
//! probes; `received` counts acknowledged probes that are still inside the
//! window, so the loss ratio is always computed over the same set of probes.

use std::collections::BTreeMap;

use tendril_core::wire::PingPacket;

/// Default number of probes remembered per peer.
pub const DEFAULT_WINDOW: usize = 100;

/// One outstanding (or answered) probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightProbe {
    pub id: i64,
    /// Unix nanoseconds at send time, echoed back by the responder.
    pub sent_at: i64,
    pub acknowledged: bool,
}

#[derive(Debug)]
pub struct ProbeWindow {
    cap: usize,
    inflight: BTreeMap<i64, InFlightProbe>,
    received: i64,
    /// Smoothed round-trip time in nanoseconds.
    latency: i64,
}

impl Default for ProbeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ProbeWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            inflight: BTreeMap::new(),
            received: 0,
            latency: 0,
        }
    }

    /// Allocate the next probe id, remember it, and build the request.
    pub fn next_probe(&mut self, now_nanos: i64) -> PingPacket {
        let id = self.max_id().map_or(1, |max| max + 1);
        self.inflight.insert(
            id,
            InFlightProbe {
                id,
                sent_at: now_nanos,
                acknowledged: false,
            },
        );
        self.trim();
        PingPacket::request(id, now_nanos)
    }

    /// Account for a response. Returns the measured round trip in
    /// nanoseconds, or `None` when the id is unknown or already answered.
    pub fn record_response(&mut self, reply: &PingPacket, now_nanos: i64) -> Option<i64> {
        let probe = self.inflight.get_mut(&reply.id)?;
        if probe.acknowledged {
            return None;
        }
        probe.acknowledged = true;

        let relay = now_nanos.saturating_sub(probe.sent_at).max(0);
        let n = self.received as i128;
        self.latency = ((self.latency as i128 * n + relay as i128) / (n + 1)) as i64;
        self.received += 1;
        Some(relay)
    }

    fn trim(&mut self) {
        while self.inflight.len() > self.cap {
            if let Some((_, oldest)) = self.inflight.pop_first() {
                // Only acknowledged probes were ever counted.
                if oldest.acknowledged {
                    self.received -= 1;
                }
            }
        }
    }

    /// Fraction of probes in the window that were never answered.
    pub fn packet_loss(&self) -> f32 {
        if self.inflight.is_empty() {
            return 0.0;
        }
        let ratio = self.received as f32 / self.inflight.len() as f32;
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    pub fn latency(&self) -> i64 {
        self.latency
    }

    pub fn received(&self) -> i64 {
        self.received
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Highest id handed out that is still in the window.
    pub fn max_id(&self) -> Option<i64> {
        self.inflight.keys().next_back().copied()
    }
}
