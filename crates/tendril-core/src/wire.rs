//! Tendril wire format: the two datagram kinds exchanged on the mesh socket.
//!
//! Every datagram starts with a one-byte packet type. Ping datagrams have a
//! fixed length; sync datagrams are a fixed header followed by zero or more
//! fixed-size peer records. All integers are big-endian.
//!
//! The frame structs are `#[repr(C)]` over zerocopy's byte-order types, so
//! they have alignment 1, no padding, and can be read straight out of a
//! receive buffer without unsafe code.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, F32, I64, U16, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Packet Type ───────────────────────────────────────────────────────────────

/// Leading type byte of every mesh datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Echo probe sent by the measuring node.
    PingRequest = 0x00,
    /// Echo reply; carries the request id and echo timestamp back.
    PingResponse = 0x01,
    /// Gossip digest of the sender's peer table.
    Sync = 0x02,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PingRequest),
            0x01 => Ok(PacketType::PingResponse),
            0x02 => Ok(PacketType::Sync),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t as u8
    }
}

// ── Ping ──────────────────────────────────────────────────────────────────────

/// On-wire ping frame, shared by requests and responses.
///
/// Wire size: 26 bytes. The trailing byte is reserved and always zero; it
/// keeps the frame the same length as deployed gateways expect.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PingFrame {
    pub packet_type: u8,
    pub id: I64<BigEndian>,
    /// Sender's clock in unix nanoseconds when the request left.
    pub echo_timestamp: I64<BigEndian>,
    /// Responder's clock in unix nanoseconds. Zero on requests.
    pub reply_timestamp: I64<BigEndian>,
    pub reserved: u8,
}

assert_eq_size!(PingFrame, [u8; 26]);

/// Exact length every ping datagram must have.
pub const PING_LEN: usize = std::mem::size_of::<PingFrame>();

/// Decoded ping, independent of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPacket {
    pub id: i64,
    pub echo_timestamp: i64,
    pub reply_timestamp: i64,
}

impl PingPacket {
    /// A fresh request stamped with the sender's clock.
    pub fn request(id: i64, now_nanos: i64) -> Self {
        Self {
            id,
            echo_timestamp: now_nanos,
            reply_timestamp: 0,
        }
    }

    /// Derive the reply: same id and echo timestamp, reply stamped now.
    pub fn respond(&self, now_nanos: i64) -> Self {
        Self {
            id: self.id,
            echo_timestamp: self.echo_timestamp,
            reply_timestamp: now_nanos,
        }
    }

    pub fn encode_request(&self) -> [u8; PING_LEN] {
        self.encode(PacketType::PingRequest)
    }

    pub fn encode_response(&self) -> [u8; PING_LEN] {
        self.encode(PacketType::PingResponse)
    }

    fn encode(&self, packet_type: PacketType) -> [u8; PING_LEN] {
        let frame = PingFrame {
            packet_type: packet_type.into(),
            id: I64::new(self.id),
            echo_timestamp: I64::new(self.echo_timestamp),
            reply_timestamp: I64::new(self.reply_timestamp),
            reserved: 0,
        };
        let mut out = [0u8; PING_LEN];
        out.copy_from_slice(frame.as_bytes());
        out
    }

    /// Decode a ping datagram. The length must match `PING_LEN` exactly.
    pub fn decode(buf: &[u8]) -> Result<(PacketType, Self), WireError> {
        let frame = PingFrame::read_from(buf).ok_or(WireError::PingLength {
            expected: PING_LEN,
            actual: buf.len(),
        })?;
        let packet_type = PacketType::try_from(frame.packet_type)?;
        if packet_type == PacketType::Sync {
            return Err(WireError::UnexpectedType(frame.packet_type));
        }
        Ok((
            packet_type,
            Self {
                id: frame.id.get(),
                echo_timestamp: frame.echo_timestamp.get(),
                reply_timestamp: frame.reply_timestamp.get(),
            },
        ))
    }
}

// ── Sync ──────────────────────────────────────────────────────────────────────

/// Header repeated at the front of every sync datagram.
///
/// Wire size: 23 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SyncHeader {
    pub packet_type: u8,
    /// Sender's advertised IPv4 address.
    pub ip: [u8; 4],
    pub port: U16<BigEndian>,
    /// Shared mesh secret. Receivers drop the datagram on mismatch.
    pub token: U64<BigEndian>,
    /// Sender's effective group mask.
    pub group: U64<BigEndian>,
}

assert_eq_size!(SyncHeader, [u8; 23]);

/// One peer as seen by the sender.
///
/// Wire size: 34 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PeerRecord {
    pub ip: [u8; 4],
    pub port: U16<BigEndian>,
    /// Smoothed round-trip latency in nanoseconds.
    pub latency: I64<BigEndian>,
    /// IEEE-754 loss ratio in [0, 1].
    pub packet_loss: F32<BigEndian>,
    /// Unix nanoseconds of the sender's last contact with the peer. Zero = never.
    pub last_online: I64<BigEndian>,
    pub group: U64<BigEndian>,
}

assert_eq_size!(PeerRecord, [u8; 34]);

pub const SYNC_HEADER_LEN: usize = std::mem::size_of::<SyncHeader>();
pub const PEER_RECORD_LEN: usize = std::mem::size_of::<PeerRecord>();

/// Largest sync datagram the encoder produces. Keeps every datagram under 1 KiB.
pub const MAX_SYNC_DATAGRAM: usize = 1023;

/// What one node reports about another in a sync message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerSnapshot {
    pub addr: SocketAddrV4,
    pub group: u64,
    pub latency: i64,
    pub packet_loss: f32,
    pub last_online: i64,
}

impl PeerSnapshot {
    fn to_record(self) -> PeerRecord {
        PeerRecord {
            ip: self.addr.ip().octets(),
            port: U16::new(self.addr.port()),
            latency: I64::new(self.latency),
            packet_loss: F32::new(self.packet_loss),
            last_online: I64::new(self.last_online),
            group: U64::new(self.group),
        }
    }

    fn from_record(r: &PeerRecord) -> Self {
        Self {
            addr: SocketAddrV4::new(Ipv4Addr::from(r.ip), r.port.get()),
            group: r.group.get(),
            latency: r.latency.get(),
            packet_loss: r.packet_loss.get(),
            last_online: r.last_online.get(),
        }
    }
}

/// A full gossip message before chunking / after reassembly of one datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub self_addr: SocketAddrV4,
    pub token: u64,
    pub self_group: u64,
    pub entries: Vec<PeerSnapshot>,
}

impl SyncMessage {
    fn header(&self) -> SyncHeader {
        SyncHeader {
            packet_type: PacketType::Sync.into(),
            ip: self.self_addr.ip().octets(),
            port: U16::new(self.self_addr.port()),
            token: U64::new(self.token),
            group: U64::new(self.self_group),
        }
    }

    /// How many records fit in one datagram of at most `max_datagram` bytes.
    /// Always at least one, so encoding makes progress under any cap.
    pub fn records_per_datagram(max_datagram: usize) -> usize {
        (max_datagram.saturating_sub(SYNC_HEADER_LEN) / PEER_RECORD_LEN).max(1)
    }

    /// Encode into one or more datagrams, each with a full header.
    ///
    /// Records are emitted in order, each exactly once. An empty message
    /// still produces one header-only datagram.
    pub fn encode(&self, max_datagram: usize) -> Vec<Bytes> {
        let header = self.header();
        let per = Self::records_per_datagram(max_datagram);

        if self.entries.is_empty() {
            return vec![Bytes::copy_from_slice(header.as_bytes())];
        }

        self.entries
            .chunks(per)
            .map(|chunk| {
                let mut buf = BytesMut::with_capacity(SYNC_HEADER_LEN + chunk.len() * PEER_RECORD_LEN);
                buf.put_slice(header.as_bytes());
                for entry in chunk {
                    buf.put_slice(entry.to_record().as_bytes());
                }
                buf.freeze()
            })
            .collect()
    }

    /// Decode a single sync datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header =
            SyncHeader::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
        if header.packet_type != u8::from(PacketType::Sync) {
            return Err(WireError::UnexpectedType(header.packet_type));
        }

        let body = &buf[SYNC_HEADER_LEN..];
        if body.len() % PEER_RECORD_LEN != 0 {
            return Err(WireError::SizeMismatch(buf.len()));
        }

        let entries = body
            .chunks_exact(PEER_RECORD_LEN)
            .filter_map(PeerRecord::read_from)
            .map(|r| PeerSnapshot::from_record(&r))
            .collect();

        Ok(Self {
            self_addr: SocketAddrV4::new(Ipv4Addr::from(header.ip), header.port.get()),
            token: header.token.get(),
            self_group: header.group.get(),
            entries,
        })
    }
}

// ── Timestamps ────────────────────────────────────────────────────────────────

/// Unix nanoseconds as carried on the wire. Clocks before the epoch map to 0.
pub fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Inverse of [`unix_nanos`]. Zero and negative values mean "never".
pub fn from_unix_nanos(nanos: i64) -> Option<SystemTime> {
    if nanos <= 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_nanos(nanos as u64))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unexpected packet type 0x{0:02x} for this decoder")]
    UnexpectedType(u8),

    #[error("ping packet must be {expected} bytes, got {actual}")]
    PingLength { expected: usize, actual: usize },

    #[error("sync packet truncated: {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("sync packet size mismatch: {0} bytes is not header + whole records")]
    SizeMismatch(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
