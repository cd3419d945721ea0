//! tendril-services: the mesh engine and everything it drives.
//!
//! `dispatch` owns the socket and routes datagrams, `peer` and `probe` hold
//! the table, `health` classifies it and `reconnect` acts on the verdict.

pub mod access;
pub mod dispatch;
pub mod engine;
pub mod health;
pub mod peer;
pub mod probe;
pub mod reconnect;
pub mod status;

#[cfg(test)]
mod testlog;

pub use access::HttpAccessControl;
pub use dispatch::{Dispatcher, PacketHandler};
pub use engine::{MeshEngine, MeshTimings};
pub use health::{classify, CheckReport, HealthListener, Verdict};
pub use peer::{Health, MeshSettings, MeshState, Peer};
pub use probe::ProbeWindow;
pub use reconnect::{
    AccessControl, AccessError, ConnectOutcome, Credential, ReconnectController, ReconnectError,
    ReconnectStatus,
};
pub use status::{MeshSnapshot, PeerStatus};
