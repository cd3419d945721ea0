//! HTTP API handlers: exposes the mesh table and reconnect state as JSON.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use tendril_services::{
    CheckReport, ConnectOutcome, MeshEngine, PeerStatus, ReconnectController, ReconnectStatus,
};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<MeshEngine>,
    /// Present only on server nodes.
    pub controller: Option<Arc<ReconnectController>>,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: NodeInfo,
    pub reconnect: Option<ReconnectStatus>,
    pub last_check: Option<CheckReport>,
}

#[derive(Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: String,
    pub group: u64,
    pub group_filter: u64,
    pub server: bool,
    pub peer_count: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let snapshot = state.engine.snapshot();
    let reconnect = match &state.controller {
        Some(c) => Some(c.status().await),
        None => None,
    };

    Json(StatusResponse {
        node: NodeInfo {
            address: snapshot.node.address,
            group: snapshot.node.group,
            group_filter: snapshot.node.group_filter,
            server: state.controller.is_some(),
            peer_count: snapshot.node.peer_count,
        },
        reconnect,
        last_check: snapshot.last_check,
    })
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerStatus>,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    Json(PeersResponse {
        peers: state.engine.snapshot().peers,
    })
}

// ── /connect ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct ConnectResponse {
    pub attempted: bool,
    pub ok: bool,
    pub error: Option<String>,
}

/// Trigger a reconnect immediately, bypassing the backoff counters.
pub async fn handle_connect(State(state): State<ApiState>) -> Json<ConnectResponse> {
    let Some(controller) = &state.controller else {
        return Json(ConnectResponse {
            attempted: false,
            ok: false,
            error: Some("not a server node".into()),
        });
    };

    let response = match controller.connect().await {
        Ok(outcome) => {
            tracing::info!(?outcome, "manual connect");
            ConnectResponse {
                attempted: outcome == ConnectOutcome::Connected,
                ok: true,
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "manual connect failed");
            ConnectResponse {
                attempted: true,
                ok: false,
                error: Some(e.to_string()),
            }
        }
    };
    Json(response)
}
