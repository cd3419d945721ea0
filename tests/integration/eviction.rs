use std::net::SocketAddrV4;
use std::time::Duration;

use tendril_core::wire::{PeerSnapshot, SyncMessage, MAX_SYNC_DATAGRAM};
use tokio::net::UdpSocket;

use crate::*;

/// Peers that go silent past the delete time are dropped and their probe
/// tasks stop. Bootstrap peers stay no matter what.
#[tokio::test]
async fn silent_peers_are_evicted_and_stop_being_probed() -> Result<()> {
    let dead_bootstrap: SocketAddrV4 = "127.0.0.1:7".parse()?;
    let ghost: SocketAddrV4 = "127.0.0.1:9".parse()?;

    let mut timings = fast_timings();
    timings.delete_after = Duration::from_millis(300);
    let a = spawn_node(NodeOptions {
        timings,
        ..NodeOptions::default().bootstrap(&[dead_bootstrap])
    })
    .await;

    // A fake peer tells A about `ghost`, then never speaks again.
    let fake = UdpSocket::bind("127.0.0.1:0").await?;
    let fake_addr = v4(fake.local_addr()?);
    let msg = SyncMessage {
        self_addr: fake_addr,
        token: TOKEN,
        self_group: 1,
        entries: vec![PeerSnapshot {
            addr: ghost,
            group: 1,
            latency: 0,
            packet_loss: 0.0,
            last_online: 0,
        }],
    };
    for datagram in msg.encode(MAX_SYNC_DATAGRAM) {
        send_raw(&fake, a.addr, &datagram).await?;
    }

    wait_for(Duration::from_secs(2), "A to learn the ghost", || a.knows(&ghost)).await?;
    assert!(a.knows(&fake_addr));
    let window = a.engine.probe_window(&ghost).context("no window")?;
    wait_for(Duration::from_secs(2), "probes to the ghost", || {
        window.lock().unwrap().max_id().is_some()
    })
    .await?;

    wait_for(Duration::from_secs(3), "eviction", || {
        !a.knows(&ghost) && !a.knows(&fake_addr)
    })
    .await?;
    assert!(a.knows(&dead_bootstrap));

    tokio::time::sleep(Duration::from_millis(60)).await;
    let before = window.lock().unwrap().max_id();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(window.lock().unwrap().max_id(), before, "probing continued after eviction");

    a.stop().await;
    Ok(())
}
