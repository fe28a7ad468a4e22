//! Frame codec: [`MessageHeader`] + payload <-> [`Message`].
//!
//! Plugs into `tokio_util::codec::{FramedRead, FramedWrite}`. The codec
//! carries the protocol version so that version-dependent payloads
//! (`addr` timestamps, `ping` nonces) follow what the session negotiated.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use zerocopy::{AsBytes, FromBytes};

use crate::message::{Message, PROTOCOL_VERSION};
use crate::wire::{checksum, MessageHeader, Network, WireError, HEADER_SIZE, MAX_PAYLOAD};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Message codec bound to one network and one protocol version.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    network: Network,
    version: u32,
    max_payload: usize,
}

impl MessageCodec {
    /// Codec at the highest supported protocol version.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            version: PROTOCOL_VERSION,
            max_payload: MAX_PAYLOAD,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Switch to the version negotiated during the handshake.
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = MessageHeader::read_from_prefix(&src[..HEADER_SIZE])
            .ok_or(WireError::Truncated("message header"))?;

        let magic = header.magic;
        if magic != self.network.magic() {
            return Err(WireError::UnexpectedMagic(hex::encode(magic)).into());
        }

        let length = header.payload_len();
        if length > self.max_payload {
            return Err(WireError::PayloadTooLarge(length).into());
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let command = header.command_name()?;
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if checksum(&payload) != header.checksum {
            return Err(WireError::ChecksumMismatch(command).into());
        }

        Ok(Some(Message::decode_payload(&command, payload, self.version)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        item.encode_payload(self.version, &mut payload);

        let header = MessageHeader::new(self.network, item.command(), &payload)?;

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
