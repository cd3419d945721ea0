use std::time::Duration;

use crate::*;

/// A and C only know B. Both end up knowing each other through B's syncs,
/// and each holds B's report about the other.
#[tokio::test]
async fn three_nodes_converge_through_a_hub() -> Result<()> {
    let b = spawn_node(NodeOptions::default()).await;
    let a = spawn_node(NodeOptions::default().bootstrap(&[b.addr])).await;
    let c = spawn_node(NodeOptions::default().bootstrap(&[b.addr])).await;

    wait_for(Duration::from_secs(5), "A to learn C", || a.knows(&c.addr)).await?;
    wait_for(Duration::from_secs(5), "C to learn A", || c.knows(&a.addr)).await?;

    let reports = a.engine.with_state(|s| {
        s.get(&c.addr)
            .map(|p| p.corroboration.contains_key(&b.addr))
            .unwrap_or(false)
    });
    assert!(reports, "A should hold B's report about C");

    // Discovered peers get probed, not just listed.
    wait_for(Duration::from_secs(3), "A probing C", || a.answered(&c.addr) >= 1).await?;

    a.stop().await;
    b.stop().await;
    c.stop().await;
    Ok(())
}

/// Syncs carrying a different token never change the receiver's table.
#[tokio::test]
async fn wrong_token_is_ignored() -> Result<()> {
    let b = spawn_node(NodeOptions::default()).await;
    let intruder = spawn_node(NodeOptions {
        token: TOKEN ^ 0xff,
        ..NodeOptions::default().bootstrap(&[b.addr])
    })
    .await;

    // The intruder's probes are answered, so it keeps syncing to B.
    wait_for(Duration::from_secs(3), "intruder probes answered", || {
        intruder.answered(&b.addr) >= 3
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!b.knows(&intruder.addr));
    assert!(b.engine.snapshot().peers.is_empty());

    intruder.stop().await;
    b.stop().await;
    Ok(())
}

/// A peer whose groups are all filtered is listed but never probed.
#[tokio::test]
async fn filtered_group_is_listed_but_not_probed() -> Result<()> {
    let b = spawn_node(NodeOptions {
        group: 0b01,
        group_filter: 0b10,
        ..NodeOptions::default()
    })
    .await;
    let a = spawn_node(NodeOptions {
        group: 0b10,
        ..NodeOptions::default().bootstrap(&[b.addr])
    })
    .await;

    wait_for(Duration::from_secs(3), "B to list A", || b.knows(&a.addr)).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (running, probes) = b.engine.with_state(|s| {
        let p = s.get(&a.addr).unwrap();
        (p.running, p.window().len())
    });
    assert!(!running);
    assert_eq!(probes, 0);
    assert_eq!(b.engine.snapshot().node.group, 0b01);

    a.stop().await;
    b.stop().await;
    Ok(())
}
