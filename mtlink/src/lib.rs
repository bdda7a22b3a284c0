//! # mtlink
//!
//! A modular MTProto client engine. The sub-crates are wired together here
//! for convenience:
//!
//! | Sub-crate         | Role                                                      |
//! |-------------------|-----------------------------------------------------------|
//! | `mtlink-tl-types` | TL binary encoding, MTProto service constructors          |
//! | `mtlink-crypto`   | Crypto capability, auth keys, MTProto 2.0 message crypto  |
//! | `mtlink-mtproto`  | Sans-IO session: ids, seqnos, acks, salts, codecs         |
//! | `mtlink-client`   | tokio runtime: connections, RPC pipeline, updates         |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # #[cfg(feature = "client")]
//! # async fn f() -> Result<(), mtlink::client::InvocationError> {
//! use mtlink::client::{Client, Config};
//!
//! let storage = std::sync::Arc::new(mtlink::client::InMemoryStorage::new());
//! Client::import_session(storage.as_ref(), "AwAAAAAY...")?;
//! let client = Client::connect(Config { storage, ..Config::default() }).await?;
//! let bytes = client.call_raw(vec![/* serialized request */], Default::default()).await?;
//! # let _ = bytes;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`mtlink_tl_types`]: TL primitives and service constructors.
pub use mtlink_tl_types as tl;

/// Re-export of [`mtlink_crypto`]: the crypto capability and auth keys.
pub use mtlink_crypto as crypto;

/// Re-export of [`mtlink_mtproto`]: the sans-IO session engine and codecs.
pub use mtlink_mtproto as mtproto;

/// Re-export of [`mtlink_client`] (requires `feature = "client"`).
#[cfg(feature = "client")]
pub use mtlink_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use mtlink_crypto::{AuthKey, CryptoProvider, DefaultCryptoProvider};
pub use mtlink_mtproto::{Session, SessionConfig, SessionEvent};
pub use mtlink_tl_types::{Deserializable, RemoteCall, Serializable};

#[cfg(feature = "client")]
pub use mtlink_client::{CallOptions, Client, Config, InvocationError, RpcError};
