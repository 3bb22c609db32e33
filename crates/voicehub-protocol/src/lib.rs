//! voicehub wire protocol — control-plane message types and framing.
//!
//! The control plane is newline-delimited compact JSON over TCP. A
//! frame is either a clear JSON object or the base64 of an encrypted
//! envelope (handled by the server on top of this crate); base64
//! contains no `\n`, so newline framing is always performed first.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::ProtocolError;
pub use messages::{ChannelSummary, ClientMessage, ServerMessage};
