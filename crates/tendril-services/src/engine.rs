//! The mesh engine: peer table plus the tasks that keep it current.
//!
//! Lock order is always engine state, then a peer's probe window. Probe tasks
//! touch only their own window. No lock is held across a send.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tendril_core::config::TimingConfig;
use tendril_core::wire::{unix_nanos, PacketType, PingPacket, SyncMessage, MAX_SYNC_DATAGRAM};

use crate::dispatch::{respond_to_ping, Dispatcher};
use crate::health::{classify, CheckReport, HealthListener};
use crate::peer::{MeshSettings, MeshState};
use crate::probe::ProbeWindow;
use crate::status::MeshSnapshot;

/// Eviction runs once every this many health-check periods.
pub const EVICT_CHECK_MULTIPLE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshTimings {
    pub ping_every: Duration,
    pub sync_every: Duration,
    pub check_every: Duration,
    /// Silence after which a non-bootstrap peer is dropped.
    pub delete_after: Duration,
    pub offline_time: Duration,
}

impl From<&TimingConfig> for MeshTimings {
    fn from(c: &TimingConfig) -> Self {
        Self {
            ping_every: c.ping_every(),
            sync_every: c.sync_every(),
            check_every: c.check_every(),
            delete_after: c.delete_every(),
            offline_time: c.offline_time(),
        }
    }
}

impl MeshTimings {
    pub fn evict_every(&self) -> Duration {
        self.check_every * EVICT_CHECK_MULTIPLE
    }
}

pub struct MeshEngine {
    socket: Arc<UdpSocket>,
    timings: MeshTimings,
    state: Mutex<MeshState>,
    shutdown: broadcast::Sender<()>,
}

impl MeshEngine {
    /// Build the engine and seed it with the bootstrap peers. Nothing runs
    /// until [`MeshEngine::spawn_loops`].
    pub fn new(
        socket: Arc<UdpSocket>,
        settings: &MeshSettings,
        timings: MeshTimings,
        bootstrap: &[SocketAddrV4],
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let mut state = MeshState::new(settings);
        let now = SystemTime::now();
        for addr in bootstrap {
            state.add_bootstrap(*addr, now);
        }
        Arc::new(Self {
            socket,
            timings,
            state: Mutex::new(state),
            shutdown,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timings(&self) -> MeshTimings {
        self.timings
    }

    /// Run `f` against the peer table under the engine lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&MeshState) -> R) -> R {
        f(&self.lock())
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot::capture(&self.lock())
    }

    pub fn probe_window(&self, addr: &SocketAddrV4) -> Option<Arc<Mutex<ProbeWindow>>> {
        self.lock().get(addr).map(|p| p.probe.clone())
    }

    /// Register the three packet handlers on the shared socket's dispatcher.
    pub fn install(self: &Arc<Self>, dispatcher: &Dispatcher) {
        dispatcher.register(PacketType::PingRequest, Arc::new(respond_to_ping));

        let engine = self.clone();
        dispatcher.register(
            PacketType::PingResponse,
            Arc::new(move |_: &UdpSocket, from: SocketAddrV4, datagram: &[u8]| {
                engine.handle_pong(from, datagram)
            }),
        );

        let engine = self.clone();
        dispatcher.register(
            PacketType::Sync,
            Arc::new(move |_: &UdpSocket, from: SocketAddrV4, datagram: &[u8]| {
                engine.handle_sync(from, datagram)
            }),
        );
    }

    /// Start probes for every running peer, plus the sync and eviction loops.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let running: Vec<SocketAddrV4> = self.with_state(|s| {
            s.peers().filter(|p| p.running).map(|p| p.addr).collect()
        });
        let mut tasks: Vec<JoinHandle<()>> =
            running.into_iter().filter_map(|a| self.spawn_probe(a)).collect();

        tasks.push(tokio::spawn(self.clone().sync_loop(self.shutdown.subscribe())));
        tasks.push(tokio::spawn(self.clone().evict_loop(self.shutdown.subscribe())));
        tasks
    }

    /// Periodic classification feeding `listener`. Only server nodes run it.
    pub fn spawn_health_loop(self: &Arc<Self>, listener: Arc<dyn HealthListener>) -> JoinHandle<()> {
        tokio::spawn(self.clone().health_loop(listener, self.shutdown.subscribe()))
    }

    // ── Handlers ──────────────────────────────────────────────────────────

    fn handle_pong(&self, from: SocketAddrV4, datagram: &[u8]) {
        let reply = match PingPacket::decode(datagram) {
            Ok((PacketType::PingResponse, p)) => p,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(%from, error = %e, "dropping malformed ping response");
                return;
            }
        };

        if let Some(rtt) = self.lock().record_pong(&from, &reply, SystemTime::now()) {
            tracing::trace!(%from, rtt_ns = rtt, "probe answered");
        }
    }

    fn handle_sync(&self, from: SocketAddrV4, datagram: &[u8]) {
        let msg = match SyncMessage::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%from, error = %e, "dropping malformed sync");
                return;
            }
        };

        let merged = self.lock().merge_sync(from, &msg, SystemTime::now());
        match merged {
            Ok(report) => {
                if !report.discovered.is_empty() {
                    tracing::debug!(%from, discovered = ?report.discovered, "learned peers from sync");
                }
                for addr in report.started {
                    self.spawn_probe(addr);
                }
            }
            Err(e) => tracing::info!(error = %e, "sync rejected"),
        }
    }

    // ── Loops ─────────────────────────────────────────────────────────────

    fn spawn_probe(&self, addr: SocketAddrV4) -> Option<JoinHandle<()>> {
        let (window, cancel) = {
            let state = self.lock();
            let peer = state.get(&addr)?;
            if !peer.running || peer.probe_cancelled() {
                return None;
            }
            (peer.probe.clone(), peer.cancel_signal())
        };

        tracing::debug!(%addr, "starting probe loop");
        Some(tokio::spawn(probe_loop(
            self.socket.clone(),
            addr,
            window,
            cancel,
            self.shutdown.subscribe(),
            self.timings.ping_every,
        )))
    }

    /// Send one round of sync messages. The table is read once, under one
    /// lock, and the sends happen afterwards.
    pub async fn sync_once(&self) {
        let outgoing: Vec<(SocketAddrV4, Vec<Bytes>)> = {
            let state = self.lock();
            for peer in state.peers() {
                tracing::debug!(?peer, "mesh table");
            }
            state
                .sync_targets()
                .into_iter()
                .map(|target| (target, state.build_sync_for(target).encode(MAX_SYNC_DATAGRAM)))
                .collect()
        };

        for (target, datagrams) in outgoing {
            for datagram in &datagrams {
                if let Err(e) = self.socket.send_to(datagram, SocketAddr::V4(target)).await {
                    tracing::warn!(%target, error = %e, "sync send failed");
                }
            }
        }
    }

    pub fn evict_once(&self, now: SystemTime) -> Vec<SocketAddrV4> {
        self.lock().evict_stale(now, self.timings.delete_after)
    }

    /// Classify the table. The lock is released before the caller acts on it.
    pub fn check_once(&self, now: SystemTime) -> CheckReport {
        classify(&mut self.lock(), now, self.timings.offline_time)
    }

    async fn sync_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.timings.sync_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => self.sync_once().await,
            }
        }
    }

    async fn evict_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.timings.evict_every());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let evicted = self.evict_once(SystemTime::now());
                    if !evicted.is_empty() {
                        tracing::debug!(removed = evicted.len(), "evicted stale peers");
                    }
                }
            }
        }
    }

    async fn health_loop(
        self: Arc<Self>,
        listener: Arc<dyn HealthListener>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.timings.check_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; give probes one period first.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let report = self.check_once(SystemTime::now());
                    if report.failure {
                        tracing::warn!(
                            servers = report.server_count,
                            offline = report.offline_count,
                            link_down = report.link_down_count,
                            "mesh health check failed"
                        );
                    }
                    tracing::debug!(
                        servers = report.server_count,
                        offline = report.offline_count,
                        link_down = report.link_down_count,
                        failure = report.failure,
                        "health check"
                    );
                    listener.on_check(&report).await;
                }
            }
        }
    }
}

async fn probe_loop(
    socket: Arc<UdpSocket>,
    addr: SocketAddrV4,
    window: Arc<Mutex<ProbeWindow>>,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: broadcast::Receiver<()>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if *cancel.borrow() {
                    break;
                }
                let request = window
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .next_probe(unix_nanos(SystemTime::now()));
                if let Err(e) = socket.send_to(&request.encode_request(), SocketAddr::V4(addr)).await {
                    tracing::debug!(%addr, error = %e, "probe send failed");
                }
            }
        }
    }
    tracing::debug!(%addr, "probe loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timings_follow_config_defaults() {
        let t = MeshTimings::from(&TimingConfig::default());
        assert_eq!(t.ping_every, Duration::from_millis(500));
        assert_eq!(t.check_every, Duration::from_secs(12));
        assert_eq!(t.evict_every(), Duration::from_secs(48));
    }

    #[tokio::test]
    async fn malformed_ping_response_is_a_warning() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (shutdown, _) = broadcast::channel(1);
        let engine = MeshEngine::new(
            socket,
            &MeshSettings {
                local_addr: "127.0.0.1:4432".parse().unwrap(),
                token: 1,
                group: 1,
                group_filter: 0,
                window: 8,
            },
            MeshTimings::from(&TimingConfig::default()),
            &[],
            shutdown,
        );
        let from: SocketAddrV4 = "127.0.0.1:9".parse().unwrap();
        let oversized = [1u8; 40];

        let ((), logs) = crate::testlog::capture_warnings(|| engine.handle_pong(from, &oversized));
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("dropping malformed ping response"), "{logs}");
    }

    #[tokio::test]
    async fn bootstrap_peers_seeded_and_probed() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = match socket.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = match target.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };

        let (shutdown, _) = broadcast::channel(1);
        let engine = MeshEngine::new(
            socket,
            &MeshSettings {
                local_addr: local,
                token: 1,
                group: 1,
                group_filter: 0,
                window: 8,
            },
            MeshTimings {
                ping_every: Duration::from_millis(10),
                sync_every: Duration::from_secs(60),
                check_every: Duration::from_secs(60),
                delete_after: Duration::from_secs(60),
                offline_time: Duration::from_secs(60),
            },
            &[target_addr, local],
            shutdown.clone(),
        );
        assert_eq!(engine.snapshot().peers.len(), 1);

        let tasks = engine.spawn_loops();
        assert_eq!(tasks.len(), 3);

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (kind, ping) = PingPacket::decode(&buf[..len]).unwrap();
        assert_eq!(kind, PacketType::PingRequest);
        assert_eq!(ping.id, 1);

        shutdown.send(()).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
