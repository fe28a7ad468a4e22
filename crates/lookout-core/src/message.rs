//! Protocol messages and their payload encodings.
//!
//! Only the message set the crawler acts on is decoded into structured
//! form. Any other command is carried verbatim as [`Message::Unknown`].

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::{Hash256, WireError};

/// Highest protocol version this node speaks.
pub const PROTOCOL_VERSION: u32 = 70016;

/// First version whose `addr` entries carry a timestamp.
pub const ADDR_TIME_VERSION: u32 = 31402;

/// Versions above this carry a nonce in `ping`/`pong`.
pub const BIP0031_VERSION: u32 = 60000;

/// First version whose `version` message carries the relay flag.
pub const RELAY_VERSION: u32 = 70001;

pub const MAX_ADDR_PER_MSG: u64 = 1000;
pub const MAX_INV_PER_MSG: u64 = 50_000;
pub const MAX_USER_AGENT_LEN: u64 = 256;

/// Service bits advertised in `version` and `addr`.
pub mod services {
    pub const NODE_NETWORK: u64 = 1;
    pub const NODE_BLOOM: u64 = 1 << 2;
    pub const NODE_WITNESS: u64 = 1 << 3;
    pub const NODE_NETWORK_LIMITED: u64 = 1 << 10;
}

// ── Payload types ─────────────────────────────────────────────────────────────

/// A network address as announced by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    /// Last-seen time, seconds since the epoch. Absent inside `version`.
    pub timestamp: Option<u32>,
    pub services: u64,
    pub addr: SocketAddr,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        Self {
            timestamp: None,
            services,
            addr,
        }
    }
}

/// The `version` announcement exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    /// Random value used to detect connections to ourselves.
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    WitnessTx,
    WitnessBlock,
    Other(u32),
}

impl From<u32> for InvType {
    fn from(value: u32) -> Self {
        match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            4 => InvType::CompactBlock,
            0x4000_0001 => InvType::WitnessTx,
            0x4000_0002 => InvType::WitnessBlock,
            other => InvType::Other(other),
        }
    }
}

impl From<InvType> for u32 {
    fn from(kind: InvType) -> u32 {
        match kind {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::CompactBlock => 4,
            InvType::WitnessTx => 0x4000_0001,
            InvType::WitnessBlock => 0x4000_0002,
            InvType::Other(v) => v,
        }
    }
}

/// An inventory entry: the kind of object plus its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvVector {
    pub kind: InvType,
    pub hash: Hash256,
}

impl InvVector {
    pub fn is_tx(&self) -> bool {
        matches!(self.kind, InvType::Tx | InvType::WitnessTx)
    }

    pub fn is_block(&self) -> bool {
        matches!(
            self.kind,
            InvType::Block | InvType::WitnessBlock | InvType::FilteredBlock | InvType::CompactBlock
        )
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvVector>),
    GetData(Vec<InvVector>),
    /// Serialized transaction, kept opaque.
    Tx(Bytes),
    /// Serialized block, kept opaque.
    Block(Bytes),
    Unknown { command: String, payload: Bytes },
}

impl Message {
    /// The command name carried in the frame header.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::Unknown { command, .. } => command,
        }
    }

    /// Hash of a `tx` or `block` payload. `None` for every other message.
    ///
    /// Transactions hash the full serialization; blocks hash the 80-byte header.
    pub fn content_hash(&self) -> Option<Hash256> {
        match self {
            Message::Tx(raw) => Some(Hash256::digest(raw)),
            Message::Block(raw) if raw.len() >= 80 => Some(Hash256::digest(&raw[..80])),
            _ => None,
        }
    }

    /// Serialize the payload (without frame header) at protocol `version`.
    pub fn encode_payload(&self, version: u32, dst: &mut BytesMut) {
        match self {
            Message::Version(v) => encode_version(v, dst),
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                if version > BIP0031_VERSION {
                    dst.put_u64_le(*nonce);
                }
            }
            Message::Addr(addrs) => {
                put_varint(dst, addrs.len() as u64);
                for addr in addrs {
                    if version >= ADDR_TIME_VERSION {
                        dst.put_u32_le(addr.timestamp.unwrap_or(0));
                    }
                    put_net_address(dst, addr);
                }
            }
            Message::Inv(items) | Message::GetData(items) => {
                put_varint(dst, items.len() as u64);
                for item in items {
                    dst.put_u32_le(item.kind.into());
                    dst.put_slice(&item.hash.0);
                }
            }
            Message::Tx(raw) | Message::Block(raw) => dst.put_slice(raw),
            Message::Unknown { payload, .. } => dst.put_slice(payload),
        }
    }

    /// Parse a payload received under `command` at protocol `version`.
    pub fn decode_payload(command: &str, payload: Bytes, version: u32) -> Result<Self, WireError> {
        let mut buf = payload.clone();
        let message = match command {
            "version" => Message::Version(decode_version(&mut buf)?),
            "verack" => Message::Verack,
            "getaddr" => Message::GetAddr,
            "ping" => Message::Ping(read_nonce(&mut buf)),
            "pong" => Message::Pong(read_nonce(&mut buf)),
            "addr" => {
                let count = get_varint(&mut buf)?;
                if count > MAX_ADDR_PER_MSG {
                    return Err(WireError::TooManyEntries {
                        what: "addr",
                        count,
                        max: MAX_ADDR_PER_MSG,
                    });
                }
                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let timestamp = if version >= ADDR_TIME_VERSION {
                        need(&buf, 4, "addr timestamp")?;
                        Some(buf.get_u32_le())
                    } else {
                        None
                    };
                    let mut addr = get_net_address(&mut buf)?;
                    addr.timestamp = timestamp;
                    addrs.push(addr);
                }
                Message::Addr(addrs)
            }
            "inv" => Message::Inv(decode_inventory(&mut buf)?),
            "getdata" => Message::GetData(decode_inventory(&mut buf)?),
            "tx" => Message::Tx(payload),
            "block" => Message::Block(payload),
            other => Message::Unknown {
                command: other.to_string(),
                payload,
            },
        };
        Ok(message)
    }
}

// ── Encoding helpers ──────────────────────────────────────────────────────────

fn encode_version(v: &VersionMessage, dst: &mut BytesMut) {
    dst.put_i32_le(v.version as i32);
    dst.put_u64_le(v.services);
    dst.put_i64_le(v.timestamp);
    put_net_address(dst, &v.receiver);
    put_net_address(dst, &v.sender);
    dst.put_u64_le(v.nonce);
    put_varint(dst, v.user_agent.len() as u64);
    dst.put_slice(v.user_agent.as_bytes());
    dst.put_i32_le(v.start_height);
    if v.version >= RELAY_VERSION {
        dst.put_u8(v.relay as u8);
    }
}

fn decode_version(buf: &mut Bytes) -> Result<VersionMessage, WireError> {
    need(buf, 20, "version header")?;
    let version = buf.get_i32_le().max(0) as u32;
    let services = buf.get_u64_le();
    let timestamp = buf.get_i64_le();
    let receiver = get_net_address(buf)?;

    // Very old peers stop after addr_recv.
    if !buf.has_remaining() {
        return Ok(VersionMessage {
            version,
            services,
            timestamp,
            sender: NetAddress::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0), 0),
            receiver,
            nonce: 0,
            user_agent: String::new(),
            start_height: 0,
            relay: true,
        });
    }

    let sender = get_net_address(buf)?;
    need(buf, 8, "version nonce")?;
    let nonce = buf.get_u64_le();

    let agent_len = get_varint(buf)?;
    if agent_len > MAX_USER_AGENT_LEN {
        return Err(WireError::TooManyEntries {
            what: "user agent",
            count: agent_len,
            max: MAX_USER_AGENT_LEN,
        });
    }
    need(buf, agent_len as usize, "user agent")?;
    let agent = buf.split_to(agent_len as usize);
    let user_agent = String::from_utf8_lossy(&agent).into_owned();

    need(buf, 4, "start height")?;
    let start_height = buf.get_i32_le();
    let relay = if buf.has_remaining() {
        buf.get_u8() != 0
    } else {
        true
    };

    Ok(VersionMessage {
        version,
        services,
        timestamp,
        receiver,
        sender,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

fn decode_inventory(buf: &mut Bytes) -> Result<Vec<InvVector>, WireError> {
    let count = get_varint(buf)?;
    if count > MAX_INV_PER_MSG {
        return Err(WireError::TooManyEntries {
            what: "inventory",
            count,
            max: MAX_INV_PER_MSG,
        });
    }
    need(buf, count as usize * 36, "inventory")?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = InvType::from(buf.get_u32_le());
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        items.push(InvVector {
            kind,
            hash: Hash256(hash),
        });
    }
    Ok(items)
}

fn read_nonce(buf: &mut Bytes) -> u64 {
    if buf.remaining() >= 8 {
        buf.get_u64_le()
    } else {
        0
    }
}

fn put_net_address(dst: &mut BytesMut, addr: &NetAddress) {
    dst.put_u64_le(addr.services);
    let ip = match addr.addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    dst.put_slice(&ip.octets());
    dst.put_u16(addr.addr.port());
}

fn get_net_address(buf: &mut Bytes) -> Result<NetAddress, WireError> {
    need(buf, 26, "network address")?;
    let services = buf.get_u64_le();
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16();

    let v6 = Ipv6Addr::from(octets);
    let ip = match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    };
    Ok(NetAddress {
        timestamp: None,
        services,
        addr: SocketAddr::new(ip, port),
    })
}

/// Write a CompactSize integer.
pub fn put_varint(dst: &mut BytesMut, value: u64) {
    match value {
        0..=0xfc => dst.put_u8(value as u8),
        0xfd..=0xffff => {
            dst.put_u8(0xfd);
            dst.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            dst.put_u8(0xfe);
            dst.put_u32_le(value as u32);
        }
        _ => {
            dst.put_u8(0xff);
            dst.put_u64_le(value);
        }
    }
}

/// Read a CompactSize integer, rejecting non-canonical encodings.
pub fn get_varint(buf: &mut Bytes) -> Result<u64, WireError> {
    need(buf, 1, "varint")?;
    let (value, min) = match buf.get_u8() {
        0xfd => {
            need(buf, 2, "varint")?;
            (buf.get_u16_le() as u64, 0xfd)
        }
        0xfe => {
            need(buf, 4, "varint")?;
            (buf.get_u32_le() as u64, 0x1_0000)
        }
        0xff => {
            need(buf, 8, "varint")?;
            (buf.get_u64_le(), 0x1_0000_0000)
        }
        small => return Ok(small as u64),
    };
    if value < min {
        return Err(WireError::Malformed("non-canonical varint"));
    }
    Ok(value)
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated(what))
    } else {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
