//! Sans-IO MTProto session engine.
//!
//! This crate handles:
//! * Message ids, seqno and the encrypted envelope ([`state`])
//! * Pending requests, acknowledgements, containers, pings and every
//!   service message the server can send ([`session`])
//! * Server salt rotation ([`salt`])
//! * Transport framing, plain and obfuscated ([`codec`], [`obfuscated`])
//! * Small building blocks shared with the client: [`Scheduler`],
//!   [`FloodControl`], [`LruCache`]
//!
//! Nothing here performs IO or reads a clock: callers pass the current time
//! in milliseconds and move the bytes themselves.

#![deny(unsafe_code)]

pub mod codec;
pub mod envelope;
pub mod flood_control;
pub mod lru;
pub mod message;
pub mod obfuscated;
pub mod salt;
pub mod scheduler;
pub mod session;
pub mod state;

pub use codec::{AbridgedCodec, CodecError, CodecEvent, IntermediateCodec, PacketCodec, TransportError};
pub use flood_control::FloodControl;
pub use lru::LruCache;
pub use message::{MsgIdGenerator, OutgoingMessage, unix_now_ms};
pub use obfuscated::{MtProxyInfo, ObfuscatedCodec};
pub use salt::{Salt, ServerSaltManager};
pub use scheduler::{Scheduler, TimerId};
pub use session::{RequestId, Session, SessionConfig, SessionEvent};
pub use state::{IncomingMessage, SessionState};

use mtlink_crypto::{CryptoError, DecryptError};

/// Errors raised by the session engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to decrypt message: {0}")]
    Decrypt(#[from] DecryptError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("message belongs to session {got:#x}")]
    SessionMismatch { got: i64 },
    #[error("inner message length {0} does not fit the frame")]
    InvalidLength(usize),
    #[error("invalid padding length {0}")]
    InvalidPadding(usize),
    #[error("malformed message: {0}")]
    Deserialize(#[from] mtlink_tl_types::deserialize::Error),
    #[error("gzip: {0}")]
    Gzip(String),
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}

impl SessionError {
    /// Whether the connection carrying the frame must be torn down.
    ///
    /// A frame that fails authentication, or decrypts to garbage, means the
    /// stream can no longer be trusted.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Decrypt(_) | Self::InvalidLength(_) | Self::InvalidPadding(_))
    }
}
