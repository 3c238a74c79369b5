//! Message framing over the chunked channel
//!
//! A message travels as an 8-byte little-endian length followed by the payload
//! split into pieces of at most `chunk-size` bytes. The sender never blocks
//! indefinitely: each piece is retried a fixed number of times with a short
//! backoff before the counterpart is declared detached.

use tokio::time::Instant;
use tracing::debug;

use std::time::Duration;

use super::queue::{ChannelHandle, TransportError};
use crate::config::TransportConfig;

/// Largest message a receiver will reassemble
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX: usize = 8;

/// Send `data` length-first, then in bounded pieces
pub async fn send_by_parts(handle: &ChannelHandle, data: &[u8], transport: &TransportConfig) -> Result<(), TransportError> {
    debug!(len = data.len(), chunk_size = transport.chunk_size, "send_by_parts: called");
    let prefix = (data.len() as u64).to_le_bytes();
    send_piece(handle, &prefix, transport).await?;
    for piece in data.chunks(transport.chunk_size.max(1)) {
        send_piece(handle, piece, transport).await?;
    }
    Ok(())
}

async fn send_piece(handle: &ChannelHandle, piece: &[u8], transport: &TransportConfig) -> Result<(), TransportError> {
    for attempt in 1..=transport.send_attempts {
        match handle.try_send(piece) {
            Ok(()) => return Ok(()),
            Err(TransportError::WouldBlock) => {
                debug!(%attempt, "send_piece: channel full, backing off");
                tokio::time::sleep(transport.write_delay()).await;
            }
            Err(e) => return Err(e),
        }
    }
    debug!("send_piece: attempts exhausted");
    Err(TransportError::Detached)
}

/// Reassemble one message
///
/// With `timeout` of `None` the wait is unconditional; otherwise the whole
/// message must arrive before the deadline, polled in slices of the
/// part-receive delay.
pub async fn receive_by_parts(
    handle: &ChannelHandle,
    timeout: Option<Duration>,
    transport: &TransportConfig,
) -> Result<Vec<u8>, TransportError> {
    debug!(?timeout, "receive_by_parts: called");
    let deadline = timeout.map(|t| Instant::now() + t);

    let prefix = receive_piece(handle, deadline, transport).await?;
    let prefix: [u8; LENGTH_PREFIX] = prefix
        .as_slice()
        .try_into()
        .map_err(|_| TransportError::Malformed("length prefix has wrong size"))?;
    let expected = usize::try_from(u64::from_le_bytes(prefix))
        .map_err(|_| TransportError::Malformed("announced length overflows"))?;
    if expected > MAX_MESSAGE_SIZE {
        return Err(TransportError::Malformed("announced length exceeds limit"));
    }

    let mut data = Vec::with_capacity(expected);
    while data.len() < expected {
        let piece = receive_piece(handle, deadline, transport).await?;
        if data.len() + piece.len() > expected {
            return Err(TransportError::Malformed("piece overruns announced length"));
        }
        data.extend_from_slice(&piece);
    }
    debug!(len = data.len(), "receive_by_parts: complete");
    Ok(data)
}

async fn receive_piece(
    handle: &ChannelHandle,
    deadline: Option<Instant>,
    transport: &TransportConfig,
) -> Result<Vec<u8>, TransportError> {
    let Some(deadline) = deadline else {
        return handle.receive(false).await;
    };
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(TransportError::TimedOut);
        }
        let slice = (deadline - now).min(transport.part_receive_delay());
        match handle.receive_with_timeout(slice).await {
            Err(TransportError::TimedOut) => debug!("receive_piece: still waiting"),
            other => return other,
        }
    }
}
