use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;

use tendril_api::ApiState;
use tendril_services::{Credential, HttpAccessControl, ReconnectController};

use crate::*;

async fn serve_api(state: ApiState) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}/api", listener.local_addr()?);
    tokio::spawn(tendril_api::serve_on(state, listener));
    Ok(base)
}

#[tokio::test]
async fn status_and_peers_reflect_the_mesh() -> Result<()> {
    let b = spawn_node(NodeOptions::default()).await;
    let a = spawn_node(NodeOptions::default().bootstrap(&[b.addr])).await;
    wait_for(Duration::from_secs(3), "probe answered", || a.answered(&b.addr) >= 1).await?;

    let base = serve_api(ApiState {
        engine: a.engine.clone(),
        controller: None,
    })
    .await?;

    let status: Value = reqwest::get(format!("{base}/status")).await?.json().await?;
    assert_eq!(status["node"]["address"], a.addr.to_string());
    assert_eq!(status["node"]["server"], false);
    assert_eq!(status["node"]["peer_count"], 1);
    assert!(status["reconnect"].is_null());

    let peers: Value = reqwest::get(format!("{base}/peers")).await?.json().await?;
    let list = peers["peers"].as_array().context("peers not an array")?;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["address"], b.addr.to_string());
    assert_eq!(list[0]["bootstrap"], true);

    let connect: Value = reqwest::Client::new()
        .post(format!("{base}/connect"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(connect["attempted"], false);
    assert_eq!(connect["ok"], false);

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn manual_connect_in_test_mode() -> Result<()> {
    let a = spawn_node(NodeOptions::default()).await;
    let controller = Arc::new(ReconnectController::new(
        Arc::new(HttpAccessControl::new("http://127.0.0.1:1/")?),
        vec![Credential::new("node", "secret")],
        true,
    ));
    let base = serve_api(ApiState {
        engine: a.engine.clone(),
        controller: Some(controller),
    })
    .await?;

    let connect: Value = reqwest::Client::new()
        .post(format!("{base}/connect"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(connect["ok"], true);
    assert_eq!(connect["attempted"], false);

    let status: Value = reqwest::get(format!("{base}/status")).await?.json().await?;
    assert_eq!(status["node"]["server"], true);
    assert_eq!(status["reconnect"]["test_mode"], true);
    assert_eq!(status["reconnect"]["credentials"][0]["name"], "node");
    assert!(status["reconnect"]["last_connect_time"].is_string());

    a.stop().await;
    Ok(())
}
