//! Node status, mesh table and manual connect.

use anyhow::Result;
use serde::Deserialize;

use super::http::ApiClient;

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    node: NodeInfo,
    reconnect: Option<ReconnectInfo>,
    last_check: Option<CheckInfo>,
}

#[derive(Deserialize)]
struct NodeInfo {
    address: String,
    group: u64,
    group_filter: u64,
    server: bool,
    peer_count: usize,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct ReconnectInfo {
    status: bool,
    lost_count: u32,
    lost_limit: u32,
    last_connect_time: Option<String>,
    last_check_time: Option<String>,
    last_response_text: String,
    test_mode: bool,
    credentials: Vec<CredentialInfo>,
}

#[derive(Deserialize)]
struct CredentialInfo {
    name: String,
    daily_limit_reached: bool,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct CheckInfo {
    server_count: usize,
    offline_count: usize,
    link_down_count: usize,
    failure: bool,
    checked_at: String,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
struct PeerInfo {
    address: String,
    group: u64,
    health: String,
    running: bool,
    bootstrap: bool,
    latency_ns: i64,
    packet_loss: f32,
    last_online: Option<String>,
    corroborated_by: usize,
}

#[derive(Deserialize)]
struct ConnectResponse {
    attempted: bool,
    ok: bool,
    error: Option<String>,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = ApiClient::local(port).get("status").await?;

    println!("═══════════════════════════════════════");
    println!("  Tendril Node Status");
    println!("═══════════════════════════════════════");
    println!("  Address      : {}", resp.node.address);
    println!("  Group        : {:#x}", resp.node.group);
    println!("  Group filter : {:#x}", resp.node.group_filter);
    println!("  Role         : {}", if resp.node.server { "server" } else { "client" });
    println!("  Peers        : {}", resp.node.peer_count);

    match &resp.last_check {
        Some(c) => {
            println!("\n  Last health check ({}):", c.checked_at);
            println!("  │  servers   : {}", c.server_count);
            println!("  │  offline   : {}", c.offline_count);
            println!("  │  link down : {}", c.link_down_count);
            println!("  └─ verdict   : {}", if c.failure { "FAILURE" } else { "healthy" });
        }
        None => println!("\n  No health check yet."),
    }

    if let Some(r) = &resp.reconnect {
        println!("\n  Reconnect:");
        println!("  │  link       : {}", if r.status { "up" } else { "down" });
        println!("  │  lost       : {}/{}", r.lost_count, r.lost_limit);
        println!(
            "  │  last conn  : {}",
            r.last_connect_time.as_deref().unwrap_or("never")
        );
        if r.test_mode {
            println!("  │  test mode  : on");
        }
        for c in &r.credentials {
            let flag = if c.daily_limit_reached { " (daily limit)" } else { "" };
            println!("  │  account    : {}{}", c.name, flag);
        }
        println!("  └─");
    }

    Ok(())
}

pub async fn cmd_peers(port: u16) -> Result<()> {
    let resp: PeersResponse = ApiClient::local(port).get("peers").await?;

    if resp.peers.is_empty() {
        println!("No peers known yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Mesh Peers ({})", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        let role = if p.bootstrap { " [bootstrap]" } else { "" };
        println!("  ┌─ {}{}", p.address, role);
        println!("  │  group       : {:#x}", p.group);
        println!("  │  health      : {}", p.health);
        println!("  │  probed      : {}", p.running);
        println!("  │  latency     : {:.2} ms", p.latency_ns as f64 / 1e6);
        println!("  │  loss        : {:.1}%", p.packet_loss * 100.0);
        println!("  │  reports     : {}", p.corroborated_by);
        println!(
            "  └─ last online : {}",
            p.last_online.as_deref().unwrap_or("never")
        );
    }

    Ok(())
}

pub async fn cmd_connect(port: u16) -> Result<()> {
    let resp: ConnectResponse = ApiClient::local(port).post("connect").await?;

    match (resp.ok, resp.error) {
        (true, _) if resp.attempted => println!("Connected."),
        (true, _) => println!("Test mode: connect skipped."),
        (false, Some(e)) => println!("Connect failed: {}", e),
        (false, None) => println!("Connect failed."),
    }
    Ok(())
}
