//! Per-DC authorization keys.

use crate::CryptoProvider;

/// A 256-byte authorization key plus the values derived from it.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Wrap raw key material, computing `key_id = SHA1(key)[12..20]`.
    pub fn from_bytes(data: [u8; 256], crypto: &dyn CryptoProvider) -> Self {
        let sha = crypto.sha1(&[&data[..]]);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// Like [`from_bytes`](Self::from_bytes) but for stored keys of unknown length.
    pub fn from_slice(data: &[u8], crypto: &dyn CryptoProvider) -> Option<Self> {
        let data: [u8; 256] = data.try_into().ok()?;
        Some(Self::from_bytes(data, crypto))
    }

    pub fn to_bytes(&self) -> [u8; 256] { self.data }

    /// The 8-byte key identifier prefixed to every encrypted message.
    pub fn key_id(&self) -> [u8; 8] { self.key_id }

    pub fn aux_hash(&self) -> [u8; 8] { self.aux_hash }

    /// The 32 key bytes mixed into client-originated `msg_key`s.
    pub fn client_salt(&self) -> &[u8] { &self.data[88..120] }

    /// The 32 key bytes mixed into server-originated `msg_key`s.
    pub fn server_salt(&self) -> &[u8] { &self.data[96..128] }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={:016x})", u64::from_le_bytes(self.key_id))
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool { self.key_id == other.key_id }
}

impl Eq for AuthKey {}

/// A short-lived key bound to a permanent one, valid until `expires_at`
/// (unix seconds).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempAuthKey {
    pub key: AuthKey,
    pub expires_at: i64,
}

impl TempAuthKey {
    pub fn is_expired(&self, now: i64) -> bool { now >= self.expires_at }
}
