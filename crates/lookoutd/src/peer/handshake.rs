//! `version` / `verack` exchange.
//!
//! Initiator: send version, await version, send verack.
//! Responder: await version, send version + verack, await verack.
//!
//! Unknown commands (feature negotiation such as `wtxidrelay` or
//! `sendaddrv2`) are skipped. Any other out-of-order message aborts.

use futures::{SinkExt, StreamExt};

use lookout_core::{Message, VersionMessage};

use super::{PeerError, Reader, Writer};

pub(super) async fn initiate(
    reader: &mut Reader,
    writer: &mut Writer,
    local: VersionMessage,
) -> Result<VersionMessage, PeerError> {
    let nonce = local.nonce;
    writer.send(Message::Version(local)).await?;
    let remote = expect_version(reader, nonce).await?;
    writer.send(Message::Verack).await?;
    Ok(remote)
}

pub(super) async fn respond(
    reader: &mut Reader,
    writer: &mut Writer,
    local: VersionMessage,
) -> Result<VersionMessage, PeerError> {
    let remote = expect_version(reader, local.nonce).await?;
    writer.send(Message::Version(local)).await?;
    writer.send(Message::Verack).await?;
    expect_verack(reader).await?;
    Ok(remote)
}

async fn expect_version(reader: &mut Reader, nonce: u64) -> Result<VersionMessage, PeerError> {
    match next_known(reader).await? {
        Message::Version(remote) if remote.nonce == nonce => Err(PeerError::SelfConnection),
        Message::Version(remote) => {
            tracing::debug!(
                version = remote.version,
                user_agent = %remote.user_agent,
                services = remote.services,
                "received version"
            );
            Ok(remote)
        }
        other => Err(PeerError::Unexpected(other.command().to_string())),
    }
}

async fn expect_verack(reader: &mut Reader) -> Result<(), PeerError> {
    match next_known(reader).await? {
        Message::Verack => Ok(()),
        other => Err(PeerError::Unexpected(other.command().to_string())),
    }
}

async fn next_known(reader: &mut Reader) -> Result<Message, PeerError> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Unknown { command, .. })) => {
                tracing::trace!(%command, "skipping during handshake");
            }
            Some(Ok(message)) => return Ok(message),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(PeerError::Closed),
        }
    }
}
