use std::sync::Arc;
use std::time::Duration;

use tendril_services::{Credential, HttpAccessControl, ReconnectController};

use crate::*;

fn test_mode_controller() -> Arc<ReconnectController> {
    // Test mode: the unreachable gateway is never contacted.
    let access = Arc::new(HttpAccessControl::new("http://127.0.0.1:1/").unwrap());
    Arc::new(ReconnectController::new(
        access,
        vec![Credential::new("node", "secret")],
        true,
    ))
}

/// While the only peer answers, checks pass. Once it goes quiet with nobody
/// to corroborate, the node blames its own link and the controller sees it.
#[tokio::test]
async fn losing_the_only_peer_reads_as_link_down() -> Result<()> {
    let controller = test_mode_controller();
    let b = spawn_node(NodeOptions::default()).await;
    let a = spawn_node(NodeOptions {
        listener: Some(controller.clone()),
        ..NodeOptions::default().bootstrap(&[b.addr])
    })
    .await;

    wait_for(Duration::from_secs(3), "a healthy check with B counted", || {
        a.engine.with_state(|s| {
            s.last_check()
                .map(|r| r.server_count == 1 && !r.failure)
                .unwrap_or(false)
        })
    })
    .await?;
    assert!(controller.status().await.status);

    b.stop().await;

    wait_for(Duration::from_secs(3), "a failed check", || {
        a.engine.with_state(|s| {
            s.last_check()
                .map(|r| r.link_down_count == 1 && r.failure)
                .unwrap_or(false)
        })
    })
    .await?;

    let deadline = Instant::now() + Duration::from_secs(2);
    while controller.status().await.status {
        if Instant::now() > deadline {
            bail!("controller never saw the link go down");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(controller.status().await.last_check_time.is_some());

    a.stop().await;
    Ok(())
}
