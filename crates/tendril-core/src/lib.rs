//! tendril-core: wire format and configuration shared by every Tendril crate.

pub mod config;
pub mod wire;

pub use wire::{PacketType, PeerSnapshot, PingPacket, SyncMessage, WireError};
