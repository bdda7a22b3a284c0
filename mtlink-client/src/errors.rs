use std::{fmt, io};

use mtlink_mtproto::SessionError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in an `rpc_error` answer.
///
/// Numeric suffixes are split off the message: `FLOOD_WAIT_30` becomes
/// `name = "FLOOD_WAIT"`, `value = Some(30)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// HTTP-like status code (303, 400, 420, 500, ...). Negative for
    /// transport-level pseudo errors such as `-503`.
    pub code: i32,
    /// The error name without its numeric suffix.
    pub name: String,
    /// The numeric suffix, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error message.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self { code, name: message[..idx].to_string(), value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with an optional `*` at either end:
    ///
    /// - `"FLOOD_WAIT"` matches exactly
    /// - `"PHONE_CODE_*"` matches any name starting with `PHONE_CODE_`
    /// - `"*_INVALID"` matches any name ending with `_INVALID`
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// The message as the server wrote it, suffix included.
    pub fn message(&self) -> String {
        match self.value {
            Some(v) => format!("{}_{v}", self.name),
            None => self.name.clone(),
        }
    }

    /// Seconds to wait if this is one of the flood-wait family of errors.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code != 420 {
            return None;
        }
        FLOOD_WAIT_NAMES
            .iter()
            .any(|n| self.name == *n)
            .then(|| self.value.unwrap_or(0) as u64)
    }

    /// Errors the server raises when it failed on its side. These are worth
    /// retrying; everything else is the caller's fault or a redirect.
    pub fn is_internal(&self) -> bool {
        self.code >= 500 || self.code == -503
    }
}

/// Error names carrying a wait in seconds.
pub(crate) const FLOOD_WAIT_NAMES: &[&str] =
    &["FLOOD_WAIT", "SLOWMODE_WAIT", "FLOOD_TEST_PHONE_WAIT", "FLOOD_PREMIUM_WAIT"];

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type of every call made through the client.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// The server answered with `rpc_error`.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// No answer within the call timeout, or the server kept failing
    /// with `-503`.
    #[error("request timed out")]
    Timeout,
    /// The caller aborted the request.
    #[error("request was cancelled")]
    Cancelled,
    /// The connection could not be trusted (bad message key, unknown auth
    /// key). The connection was torn down.
    #[error("security error: {0}")]
    Security(String),
    /// The transport reported an error code instead of a packet.
    #[error("transport error {0}")]
    Transport(i32),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The answer did not have the expected shape.
    #[error("deserialize error: {0}")]
    Deserialize(String),
    /// The request was refused before being sent.
    #[error("invalid argument: {0}")]
    Argument(String),
    /// Something this library does not do.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The connection serving the request went away.
    #[error("request dropped")]
    Dropped,
}

impl InvocationError {
    /// Match an RPC error name. Always `false` for non-RPC errors.
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }

    /// Shorthand for [`RpcError::flood_wait_seconds`].
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _ => None,
        }
    }

    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<mtlink_tl_types::deserialize::Error> for InvocationError {
    fn from(e: mtlink_tl_types::deserialize::Error) -> Self { Self::Deserialize(e.to_string()) }
}

impl From<SessionError> for InvocationError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::PayloadTooLarge(n) => Self::Argument(format!("payload of {n} bytes is too large")),
            e if e.is_security_violation() => Self::Security(e.to_string()),
            e => Self::Deserialize(e.to_string()),
        }
    }
}
