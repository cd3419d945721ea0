//! Read-only views of the mesh, serialized by the status API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::CheckReport;
use crate::peer::{Health, MeshState, Peer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: String,
    pub group: u64,
    pub group_filter: u64,
    pub peer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub address: String,
    pub group: u64,
    pub health: Health,
    pub running: bool,
    pub bootstrap: bool,
    pub latency_ns: i64,
    pub packet_loss: f32,
    pub last_online: Option<DateTime<Utc>>,
    /// Observers that reported on this peer.
    pub corroborated_by: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSnapshot {
    pub node: NodeStatus,
    pub peers: Vec<PeerStatus>,
    pub last_check: Option<CheckReport>,
}

impl PeerStatus {
    fn from_peer(peer: &Peer, bootstrap: bool) -> Self {
        let window = peer.window();
        Self {
            address: peer.addr.to_string(),
            group: peer.group,
            health: peer.health,
            running: peer.running,
            bootstrap,
            latency_ns: window.latency(),
            packet_loss: window.packet_loss(),
            last_online: peer.last_online.map(DateTime::<Utc>::from),
            corroborated_by: peer.corroboration.len(),
        }
    }
}

impl MeshSnapshot {
    pub fn capture(state: &MeshState) -> Self {
        Self {
            node: NodeStatus {
                address: state.local_addr().to_string(),
                group: state.local_group(),
                group_filter: state.group_filter(),
                peer_count: state.len(),
            },
            peers: state
                .peers()
                .map(|p| PeerStatus::from_peer(p, state.is_bootstrap(&p.addr)))
                .collect(),
            last_check: state.last_check().cloned(),
        }
    }
}
