//! Tendril integration test harness.
//!
//! Every test runs real engines in-process on 127.0.0.1 with ephemeral
//! ports and short timings, so nothing here needs privileges or fixtures.
//! Each test stops the nodes it starts.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tendril_services::peer::MeshSettings;
use tendril_services::{Dispatcher, HealthListener, MeshEngine, MeshTimings};

mod eviction;
mod gossip;
mod health;
mod probing;
mod status;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const TOKEN: u64 = 0x7e4d_0001;

pub fn fast_timings() -> MeshTimings {
    MeshTimings {
        ping_every: Duration::from_millis(20),
        sync_every: Duration::from_millis(50),
        check_every: Duration::from_millis(50),
        delete_after: Duration::from_secs(30),
        offline_time: Duration::from_millis(100),
    }
}

#[derive(Clone)]
pub struct NodeOptions {
    pub token: u64,
    pub group: u64,
    pub group_filter: u64,
    pub bootstrap: Vec<SocketAddrV4>,
    pub timings: MeshTimings,
    pub listener: Option<Arc<dyn HealthListener>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            token: TOKEN,
            group: 1,
            group_filter: 0,
            bootstrap: Vec::new(),
            timings: fast_timings(),
            listener: None,
        }
    }
}

impl NodeOptions {
    pub fn bootstrap(mut self, addrs: &[SocketAddrV4]) -> Self {
        self.bootstrap = addrs.to_vec();
        self
    }
}

pub struct Node {
    pub addr: SocketAddrV4,
    pub engine: Arc<MeshEngine>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    dispatch_task: JoinHandle<Result<()>>,
}

impl Node {
    /// Whether this node's table currently holds `addr`.
    pub fn knows(&self, addr: &SocketAddrV4) -> bool {
        self.engine.with_state(|s| s.get(addr).is_some())
    }

    /// Answered probes currently in this node's window for `addr`.
    pub fn answered(&self, addr: &SocketAddrV4) -> i64 {
        self.engine
            .probe_window(addr)
            .map(|w| w.lock().unwrap().received())
            .unwrap_or(0)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            task.abort();
        }
        let _ = self.dispatch_task.await;
    }
}

pub fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => panic!("expected an IPv4 address, got {addr}"),
    }
}

pub async fn spawn_node(opts: NodeOptions) -> Node {
    let dispatcher = Arc::new(Dispatcher::bind("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = v4(dispatcher.local_addr().unwrap());

    let (shutdown, _) = broadcast::channel(1);
    let engine = MeshEngine::new(
        dispatcher.socket(),
        &MeshSettings {
            local_addr: addr,
            token: opts.token,
            group: opts.group,
            group_filter: opts.group_filter,
            window: 100,
        },
        opts.timings,
        &opts.bootstrap,
        shutdown.clone(),
    );
    engine.install(&dispatcher);

    let mut tasks = engine.spawn_loops();
    if let Some(listener) = opts.listener {
        tasks.push(engine.spawn_health_loop(listener));
    }
    let dispatch_task = tokio::spawn(dispatcher.run(shutdown.subscribe()));

    Node {
        addr,
        engine,
        shutdown,
        tasks,
        dispatch_task,
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn wait_for<F>(within: Duration, what: &str, mut cond: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        if cond() {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("timed out after {within:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Send a raw datagram from a throwaway socket.
pub async fn send_raw(from: &tokio::net::UdpSocket, to: SocketAddrV4, bytes: &[u8]) -> Result<()> {
    from.send_to(bytes, SocketAddr::V4(to))
        .await
        .context("raw send failed")?;
    Ok(())
}
