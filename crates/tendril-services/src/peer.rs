//! Mesh peer table: who we know, what we have heard about them, and which
//! of them we actively probe.
//!
//! Everything here is plain state guarded by the engine's lock. I/O and task
//! spawning happen in the engine after the lock is released; the methods
//! return the addresses whose probe tasks need starting.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use tendril_core::wire::{unix_nanos, PeerSnapshot, SyncMessage};

use crate::health::CheckReport;
use crate::probe::ProbeWindow;

/// Classification of a peer from the last health pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Not yet classified.
    #[default]
    Unknown,
    Online,
    /// Unreachable from here but not confirmed by others.
    LinkDown,
    /// Unreachable and confirmed by a quorum of observers.
    Offline,
}

/// Identity and tuning the peer table needs. Nothing else.
#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub local_addr: SocketAddrV4,
    pub token: u64,
    pub group: u64,
    pub group_filter: u64,
    /// Probe window capacity for new peers.
    pub window: usize,
}

pub struct Peer {
    pub addr: SocketAddrV4,
    pub group: u64,
    /// Accepted by the group filter and actively probed.
    pub running: bool,
    pub health: Health,
    /// Last time a probe answer or sync message arrived from this peer.
    pub last_online: Option<SystemTime>,
    pub discovered_at: SystemTime,
    /// What other peers last reported about this one, keyed by observer.
    pub corroboration: HashMap<SocketAddrV4, PeerSnapshot>,
    pub probe: Arc<Mutex<ProbeWindow>>,
    cancel: watch::Sender<bool>,
}

impl Peer {
    fn new(addr: SocketAddrV4, group: u64, running: bool, now: SystemTime, window: usize) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            addr,
            group,
            running,
            health: Health::Unknown,
            last_online: None,
            discovered_at: now,
            corroboration: HashMap::new(),
            probe: Arc::new(Mutex::new(ProbeWindow::new(window))),
            cancel,
        }
    }

    pub fn window(&self) -> MutexGuard<'_, ProbeWindow> {
        self.probe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver that flips to `true` when probing of this peer must stop.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn probe_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn cancel_probe(&self) {
        self.cancel.send_replace(true);
    }

    /// Fresh cancellation channel; any task still watching the old one stops.
    fn rearm_probe(&mut self) {
        self.cancel_probe();
        let (cancel, _) = watch::channel(false);
        self.cancel = cancel;
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let window = self.window();
        PeerSnapshot {
            addr: self.addr,
            group: self.group,
            latency: window.latency(),
            packet_loss: window.packet_loss(),
            last_online: self.last_online.map(unix_nanos).unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("group", &format_args!("{:#x}", self.group))
            .field("running", &self.running)
            .field("health", &self.health)
            .field("last_online", &self.last_online)
            .field("corroboration", &self.corroboration.len())
            .finish()
    }
}

/// Sync rejected before any state changed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("sync from {from} carries the wrong token")]
    TokenMismatch { from: SocketAddrV4 },
}

/// Side effects of a merge the caller must carry out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Peers whose probe tasks must be spawned.
    pub started: Vec<SocketAddrV4>,
    /// Newly learned peers, running or not.
    pub discovered: Vec<SocketAddrV4>,
    pub corroborated: usize,
}

pub struct MeshState {
    pub(crate) local_addr: SocketAddrV4,
    token: u64,
    pub(crate) group_filter: u64,
    pub(crate) local_group: u64,
    window: usize,
    pub(crate) peers: BTreeMap<SocketAddrV4, Peer>,
    bootstrap: HashSet<SocketAddrV4>,
    pub(crate) last_check: Option<CheckReport>,
}

/// Group 0 is a member of every group.
pub fn groups_overlap(a: u64, b: u64) -> bool {
    a == 0 || b == 0 || a & b != 0
}

impl MeshState {
    pub fn new(settings: &MeshSettings) -> Self {
        Self {
            local_addr: settings.local_addr,
            token: settings.token,
            group_filter: settings.group_filter,
            local_group: settings.group & !settings.group_filter,
            window: settings.window,
            peers: BTreeMap::new(),
            bootstrap: HashSet::new(),
            last_check: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn local_group(&self) -> u64 {
        self.local_group
    }

    pub fn group_filter(&self) -> u64 {
        self.group_filter
    }

    pub fn last_check(&self) -> Option<&CheckReport> {
        self.last_check.as_ref()
    }

    pub fn get(&self, addr: &SocketAddrV4) -> Option<&Peer> {
        self.peers.get(addr)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_bootstrap(&self, addr: &SocketAddrV4) -> bool {
        self.bootstrap.contains(addr)
    }

    /// A peer is probed unless every one of its group bits is filtered.
    /// Group 0 means the peer has not told us yet.
    pub fn accepts_group(&self, group: u64) -> bool {
        group == 0 || group & !self.group_filter != 0
    }

    fn absorb_group(&mut self, group: u64) {
        self.local_group |= group & !self.group_filter;
    }

    /// Whether a peer is inside our set of groups for sync and health.
    pub fn shares_group(&self, peer_group: u64) -> bool {
        groups_overlap(peer_group, self.local_group)
    }

    /// Add a statically configured peer. Bootstrap peers are never evicted.
    pub fn add_bootstrap(&mut self, addr: SocketAddrV4, now: SystemTime) -> Option<bool> {
        if addr == self.local_addr {
            return None;
        }
        self.bootstrap.insert(addr);
        self.register(addr, 0, now)
    }

    /// Insert a newly discovered peer. Returns `None` for ourselves or a
    /// peer we already track, otherwise whether it will be probed.
    pub fn register(&mut self, addr: SocketAddrV4, group: u64, now: SystemTime) -> Option<bool> {
        if addr == self.local_addr || self.peers.contains_key(&addr) {
            return None;
        }

        let running = self.accepts_group(group);
        if running {
            self.absorb_group(group);
        } else {
            tracing::debug!(%addr, group = format_args!("{group:#x}"), "peer group filtered, not probing");
        }

        self.peers
            .insert(addr, Peer::new(addr, group, running, now, self.window));
        tracing::info!(%addr, running, "peer registered");
        Some(running)
    }

    /// Record a probe answer from `from`. Returns the round trip in
    /// nanoseconds when it matched an outstanding probe.
    pub fn record_pong(
        &mut self,
        from: &SocketAddrV4,
        reply: &tendril_core::wire::PingPacket,
        now: SystemTime,
    ) -> Option<i64> {
        let peer = self.peers.get_mut(from)?;
        let relay = peer.window().record_response(reply, unix_nanos(now))?;
        peer.last_online = Some(now);
        Some(relay)
    }

    /// Fold one received sync datagram into the table.
    ///
    /// `from` is the UDP source address; it identifies the sender.
    pub fn merge_sync(
        &mut self,
        from: SocketAddrV4,
        msg: &SyncMessage,
        now: SystemTime,
    ) -> Result<MergeReport, SyncError> {
        if msg.token != self.token {
            return Err(SyncError::TokenMismatch { from });
        }

        let mut report = MergeReport::default();
        if from == self.local_addr {
            return Ok(report);
        }

        self.learn(from, msg.self_group, now, &mut report);
        self.refresh_sender(from, msg.self_group, now, &mut report);

        for entry in &msg.entries {
            if entry.addr == self.local_addr {
                continue;
            }
            if entry.addr == from {
                if entry.group != 0 {
                    self.refresh_sender(from, entry.group, now, &mut report);
                }
                continue;
            }

            self.learn(entry.addr, entry.group, now, &mut report);
            if let Some(subject) = self.peers.get_mut(&entry.addr) {
                subject.corroboration.insert(from, *entry);
                report.corroborated += 1;
            }
        }

        Ok(report)
    }

    fn learn(&mut self, addr: SocketAddrV4, group: u64, now: SystemTime, report: &mut MergeReport) {
        if let Some(running) = self.register(addr, group, now) {
            report.discovered.push(addr);
            if running {
                report.started.push(addr);
            }
        }
    }

    /// The sender is alive and tells us its group. Group changes can flip
    /// whether we probe it.
    fn refresh_sender(
        &mut self,
        from: SocketAddrV4,
        group: u64,
        now: SystemTime,
        report: &mut MergeReport,
    ) {
        let accepted = self.accepts_group(group);
        let Some(sender) = self.peers.get_mut(&from) else {
            return;
        };
        sender.last_online = Some(now);
        if group == 0 || sender.group == group {
            return;
        }

        sender.group = group;
        if accepted && !sender.running {
            sender.running = true;
            sender.rearm_probe();
            if !report.started.contains(&from) {
                report.started.push(from);
            }
        } else if !accepted && sender.running {
            sender.running = false;
            sender.cancel_probe();
            report.started.retain(|a| a != &from);
            tracing::info!(%from, "peer moved into a filtered group, probing stopped");
        }
        if accepted {
            self.absorb_group(group);
        }
    }

    /// Peers that receive our sync messages.
    pub fn sync_targets(&self) -> Vec<SocketAddrV4> {
        self.peers
            .values()
            .filter(|p| p.running && p.health != Health::Offline && self.shares_group(p.group))
            .map(|p| p.addr)
            .collect()
    }

    /// Our view of the mesh, as sent to `target`. The target itself is left out.
    pub fn build_sync_for(&self, target: SocketAddrV4) -> SyncMessage {
        let entries = self
            .peers
            .values()
            .filter(|p| p.addr != target && p.running && p.health != Health::Offline)
            .map(Peer::snapshot)
            .collect();
        SyncMessage {
            self_addr: self.local_addr,
            token: self.token,
            self_group: self.local_group,
            entries,
        }
    }

    /// Drop peers silent for longer than `delete_after` and stop their
    /// probes. Bootstrap peers stay.
    pub fn evict_stale(&mut self, now: SystemTime, delete_after: Duration) -> Vec<SocketAddrV4> {
        let stale: Vec<SocketAddrV4> = self
            .peers
            .values()
            .filter(|p| !self.bootstrap.contains(&p.addr))
            .filter(|p| p.last_online.unwrap_or(p.discovered_at) + delete_after < now)
            .map(|p| p.addr)
            .collect();

        for addr in &stale {
            if let Some(peer) = self.peers.remove(addr) {
                peer.cancel_probe();
                tracing::info!(%addr, "evicted stale peer");
            }
        }
        for peer in self.peers.values_mut() {
            peer.corroboration.retain(|observer, _| !stale.contains(observer));
        }
        stale
    }
}
