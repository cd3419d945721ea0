//! Quorum health classification, run periodically on server nodes.
//!
//! A peer we have not heard from is only declared `Offline` when most of the
//! peers sharing its groups agree. Otherwise the fault is assumed to be on
//! our side of the link (`LinkDown`), which is what drives reconnection.

use std::net::SocketAddrV4;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tendril_core::wire::from_unix_nanos;

use crate::peer::{groups_overlap, Health, MeshState, Peer};

/// Observers that must agree before a silent peer counts as offline.
pub const OFFLINE_QUORUM: f64 = 0.6;

/// Share of offline peers above which the node itself is considered cut off.
pub const FAILURE_RATIO: f64 = 0.6;

/// Outcome of one classification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Seen peers sharing a group with us.
    pub server_count: usize,
    pub offline_count: usize,
    pub link_down_count: usize,
    pub failure: bool,
    pub checked_at: DateTime<Utc>,
}

impl CheckReport {
    pub fn verdict(&self) -> Verdict {
        if self.failure {
            Verdict::Failure
        } else {
            Verdict::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    Failure,
}

/// Receives every classification outcome.
#[async_trait]
pub trait HealthListener: Send + Sync {
    async fn on_check(&self, report: &CheckReport);
}

/// Classify every seen peer in our groups and compute the aggregate verdict.
///
/// Runs entirely under the caller's lock and performs no I/O.
pub fn classify(state: &mut MeshState, now: SystemTime, offline_time: Duration) -> CheckReport {
    let judged: Vec<(SocketAddrV4, Health)> = state
        .peers
        .values()
        .filter(|p| p.running && state.shares_group(p.group))
        .filter_map(|p| {
            let last = p.last_online?;
            Some((p.addr, judge(state, p, last, now, offline_time)))
        })
        .collect();

    let mut report = CheckReport {
        server_count: judged.len(),
        offline_count: 0,
        link_down_count: 0,
        failure: false,
        checked_at: DateTime::<Utc>::from(now),
    };

    for (addr, health) in judged {
        match health {
            Health::Offline => report.offline_count += 1,
            Health::LinkDown => report.link_down_count += 1,
            _ => {}
        }
        if let Some(peer) = state.peers.get_mut(&addr) {
            if peer.health != health {
                tracing::debug!(%addr, from = ?peer.health, to = ?health, "peer health changed");
            }
            peer.health = health;
        }
    }

    let offline_ratio = if report.server_count == 0 {
        0.0
    } else {
        report.offline_count as f64 / report.server_count as f64
    };
    report.failure = offline_ratio > FAILURE_RATIO || report.link_down_count > 0;

    state.last_check = Some(report.clone());
    report
}

fn judge(
    state: &MeshState,
    peer: &Peer,
    last_online: SystemTime,
    now: SystemTime,
    offline_time: Duration,
) -> Health {
    if last_online + offline_time * 2 >= now {
        return Health::Online;
    }

    let mut total = 0usize;
    let mut stale = 0usize;
    for (observer, seen) in &peer.corroboration {
        let Some(witness) = state.peers.get(observer) else {
            continue;
        };
        if !groups_overlap(witness.group, peer.group) {
            continue;
        }
        total += 1;
        let reported_stale = match from_unix_nanos(seen.last_online) {
            Some(at) => at + offline_time < now,
            None => true,
        };
        if reported_stale {
            stale += 1;
        }
    }

    if total > 0 && stale as f64 / total as f64 > OFFLINE_QUORUM {
        Health::Offline
    } else {
        Health::LinkDown
    }
}
