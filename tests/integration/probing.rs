use std::time::Duration;

use tendril_services::Health;

use crate::*;

/// A probes its bootstrap peer B; B learns A from A's sync and probes back.
#[tokio::test]
async fn ping_measures_round_trip_both_ways() -> Result<()> {
    let b = spawn_node(NodeOptions::default()).await;
    let a = spawn_node(NodeOptions::default().bootstrap(&[b.addr])).await;

    wait_for(Duration::from_secs(3), "A's probes answered", || a.answered(&b.addr) >= 3).await?;
    wait_for(Duration::from_secs(3), "B to learn A", || b.knows(&a.addr)).await?;
    wait_for(Duration::from_secs(3), "B's probes answered", || b.answered(&a.addr) >= 3).await?;

    let view = a.engine.snapshot();
    let peer = view
        .peers
        .iter()
        .find(|p| p.address == b.addr.to_string())
        .context("B missing from A's snapshot")?;
    assert!(peer.bootstrap);
    assert!(peer.running);
    assert!(peer.latency_ns > 0);
    assert!(peer.packet_loss < 1.0);
    assert!(peer.last_online.is_some());
    assert_eq!(peer.health, Health::Unknown);

    a.stop().await;
    b.stop().await;
    Ok(())
}

/// Probing stops when the node shuts down.
#[tokio::test]
async fn shutdown_stops_probe_tasks() -> Result<()> {
    let b = spawn_node(NodeOptions::default()).await;
    let a = spawn_node(NodeOptions::default().bootstrap(&[b.addr])).await;

    wait_for(Duration::from_secs(3), "first probe", || a.answered(&b.addr) >= 1).await?;
    let window = a.engine.probe_window(&b.addr).context("no window")?;

    a.stop().await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let before = window.lock().unwrap().max_id();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(window.lock().unwrap().max_id(), before);

    b.stop().await;
    Ok(())
}
