//! lookout-core: wire format, message codec and configuration.
//! All other Lookout crates depend on this one.

pub mod codec;
pub mod config;
pub mod message;
pub mod wire;

pub use codec::{CodecError, MessageCodec};
pub use message::{InvType, InvVector, Message, NetAddress, VersionMessage, PROTOCOL_VERSION};
pub use wire::{Hash256, Network, WireError};
