//! Lookout wire format: framing header, network parameters and hashes.
//!
//! Every message on the wire is a 24-byte header followed by the payload:
//!
//! ```text
//! +---------+--------------------+---------+----------+
//! |  Magic  |      Command       | Length  | Checksum |
//! | 4 bytes | 12 bytes, NUL pad  | u32 LE  | 4 bytes  |
//! +---------+--------------------+---------+----------+
//! |                   Payload (Length bytes)          |
//! +---------------------------------------------------+
//! ```
//!
//! The checksum is the first four bytes of SHA-256(SHA-256(payload)).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Message Header ────────────────────────────────────────────────────────────

/// Fixed-size frame header preceding every payload.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader {
    /// Network identifier. A mismatch is a framing error.
    pub magic: [u8; 4],
    /// ASCII command name, right-padded with NUL bytes.
    pub command: [u8; 12],
    /// Payload length, little-endian.
    pub length: [u8; 4],
    /// First four bytes of the double SHA-256 of the payload.
    pub checksum: [u8; 4],
}

assert_eq_size!(MessageHeader, [u8; 24]);

/// Size of [`MessageHeader`] on the wire.
pub const HEADER_SIZE: usize = 24;

/// Largest payload accepted from a peer (32 MiB).
pub const MAX_PAYLOAD: usize = 0x0200_0000;

impl MessageHeader {
    /// Build the header for `payload` under `command` on `network`.
    pub fn new(network: Network, command: &str, payload: &[u8]) -> Result<Self, WireError> {
        let name = command.as_bytes();
        if name.is_empty() || name.len() > 12 || !name.iter().all(u8::is_ascii_graphic) {
            return Err(WireError::InvalidCommand(command.to_string()));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let mut padded = [0u8; 12];
        padded[..name.len()].copy_from_slice(name);

        Ok(Self {
            magic: network.magic(),
            command: padded,
            length: (payload.len() as u32).to_le_bytes(),
            checksum: checksum(payload),
        })
    }

    /// Declared payload length.
    pub fn payload_len(&self) -> usize {
        u32::from_le_bytes(self.length) as usize
    }

    /// Command name with the NUL padding stripped.
    ///
    /// Fails if the name is not printable ASCII or has bytes after the padding.
    pub fn command_name(&self) -> Result<String, WireError> {
        let raw = self.command;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let (name, padding) = raw.split_at(end);
        if name.is_empty()
            || !name.iter().all(u8::is_ascii_graphic)
            || padding.iter().any(|b| *b != 0)
        {
            return Err(WireError::InvalidCommand(hex::encode(raw)));
        }
        Ok(String::from_utf8_lossy(name).into_owned())
    }
}

// ── Networks ──────────────────────────────────────────────────────────────────

/// The gossip network a node participates in.
///
/// Selects the frame magic, the default listen port and the DNS seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
    Signet,
}

impl Default for Network {
    fn default() -> Self {
        Self::Testnet
    }
}

impl Network {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
            Network::Signet => [0x0a, 0x03, 0xcf, 0x40],
        }
    }

    pub fn from_magic(magic: [u8; 4]) -> Option<Self> {
        [Network::Mainnet, Network::Testnet, Network::Regtest, Network::Signet]
            .into_iter()
            .find(|n| n.magic() == magic)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
            Network::Signet => 38333,
        }
    }

    /// DNS seeds used to bootstrap the address book.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
            ],
            Network::Testnet => &[
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
                "seed.testnet.bitcoin.sprovoost.nl",
                "testnet-seed.bluematt.me",
            ],
            Network::Regtest => &[],
            Network::Signet => &["seed.signet.bitcoin.sprovoost.nl"],
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
            Network::Signet => "signet",
        };
        f.write_str(name)
    }
}

// ── Hashes ────────────────────────────────────────────────────────────────────

/// Double SHA-256 digest identifying a transaction or block.
///
/// Displayed byte-reversed, the way block explorers print identifiers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn digest(data: &[u8]) -> Self {
        Self(sha256d(data))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Frame checksum: first four bytes of [`sha256d`].
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected network magic: {0}")]
    UnexpectedMagic(String),

    #[error("invalid command name: {0}")]
    InvalidCommand(String),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("{what} count {count} exceeds maximum {max}")]
    TooManyEntries {
        what: &'static str,
        count: u64,
        max: u64,
    },

    #[error("malformed {0}")]
    Malformed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
