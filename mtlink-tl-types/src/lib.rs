//! TL binary serialization and the MTProto service layer.
//!
//! The RPC method catalogue is generated elsewhere; this crate only carries
//! what the session engine itself needs to speak:
//!
//! | Module            | Contents                                                   |
//! |-------------------|------------------------------------------------------------|
//! | [`serialize`]     | [`Serializable`] and the primitive encodings               |
//! | [`deserialize`]   | [`Deserializable`], [`Cursor`] and the primitive decodings |
//! | [`mtproto`]       | Service constructors and functions (`rpc_result`, `pong`, `msg_container`, …) |
//!
//! ```rust
//! use mtlink_tl_types::{Serializable, mtproto::functions::Ping};
//!
//! let bytes = Ping { ping_id: 7 }.to_bytes();
//! assert_eq!(&bytes[..4], &0x7abe77ecu32.to_le_bytes());
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod mtproto;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Constructor of the boxed `Vector t`.
pub const VECTOR_ID: u32 = 0x1cb5c415;
/// `boolTrue`
pub const BOOL_TRUE_ID: u32 = 0x997275b5;
/// `boolFalse`
pub const BOOL_FALSE_ID: u32 = 0xbc799737;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
///
/// Written as a count followed by the items, without the `0x1cb5c415` header.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Opaque bytes passed through without interpretation.
///
/// Used for generic `Object` fields (the body of an `rpc_result`, an update
/// container) and for responses whose type the engine does not know.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

impl Blob {
    /// Constructor ID of the wrapped object, if it has at least four bytes.
    pub fn constructor_id(&self) -> Option<u32> {
        let b = self.0.get(..4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every boxed constructor has a unique 32-bit ID.
pub trait Identifiable {
    /// The constructor ID as written in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// A function that can be sent as an RPC call.
///
/// `Return` is the type the server will respond with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}
