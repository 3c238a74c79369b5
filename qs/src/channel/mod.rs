//! Channel transport: the shared byte channel and message framing over it

mod framing;
mod queue;

pub use framing::{MAX_MESSAGE_SIZE, receive_by_parts, send_by_parts};
pub use queue::{Channel, ChannelHandle, Role, TransportError};
