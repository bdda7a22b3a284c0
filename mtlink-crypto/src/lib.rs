//! Cryptography for MTProto 2.0 sessions.
//!
//! Provides:
//! - [`CryptoProvider`], the injected capability every other crate hashes,
//!   encrypts and draws randomness through
//! - AES-256-IGE on top of any single-block primitive
//! - [`AuthKey`] / [`TempAuthKey`]
//! - message key derivation and whole-message encryption / decryption

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod provider;

pub use auth_key::{AuthKey, TempAuthKey};
pub use provider::{AesCtr, CryptoProvider, DefaultCryptoProvider};

/// Local failures of a crypto primitive. These are programming errors and are
/// never sent to the network.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("buffer length {0} is not a multiple of the AES block size")]
    InvalidBlockLength(usize),
    #[error("invalid key length")]
    InvalidKey,
}

/// Why an incoming ciphertext was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    #[error("invalid ciphertext buffer length")]
    InvalidBuffer,
    /// The `auth_key_id` prefix does not match our key.
    #[error("auth_key_id mismatch")]
    AuthKeyMismatch,
    /// The `msg_key` does not match the one recomputed from the plaintext.
    #[error("msg_key mismatch")]
    MessageKeyMismatch,
}

// ─── Key derivation ───────────────────────────────────────────────────────────

/// Who produced a message. Selects the auth key slices used for its keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

/// Derive the AES-256-IGE `(key, iv)` for one message.
pub fn derive_message_keys(
    crypto: &dyn CryptoProvider,
    auth_key: &AuthKey,
    msg_key: &[u8; 16],
    side: Side,
) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let a = crypto.sha256(&[&msg_key[..], &auth_key.data[x..x + 36]]);
    let b = crypto.sha256(&[&auth_key.data[40 + x..76 + x], &msg_key[..]]);

    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&a[..8]);
    key[8..24].copy_from_slice(&b[8..24]);
    key[24..].copy_from_slice(&a[24..]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&b[..8]);
    iv[8..24].copy_from_slice(&a[8..24]);
    iv[24..].copy_from_slice(&b[24..]);

    (key, iv)
}

/// `msg_key = SHA256(auth_key[88+x..120+x] ‖ plaintext)[8..24]`
pub fn compute_msg_key(
    crypto: &dyn CryptoProvider,
    auth_key: &AuthKey,
    plaintext: &[u8],
    side: Side,
) -> [u8; 16] {
    let x = side.x();
    let large = crypto.sha256(&[&auth_key.data[88 + x..120 + x], plaintext]);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&large[8..24]);
    msg_key
}

/// Number of random bytes appended so the plaintext is block-aligned and the
/// padding stays within 12..=1024 bytes.
pub fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

// ─── Whole-message encryption ─────────────────────────────────────────────────

/// Pad and encrypt `plaintext`, returning `key_id ‖ msg_key ‖ ciphertext`.
pub fn encrypt_message(
    crypto: &dyn CryptoProvider,
    auth_key: &AuthKey,
    side: Side,
    mut plaintext: Vec<u8>,
) -> Result<Vec<u8>, CryptoError> {
    let start = plaintext.len();
    plaintext.resize(start + padding_len(start), 0);
    crypto.random_bytes(&mut plaintext[start..]);

    let msg_key = compute_msg_key(crypto, auth_key, &plaintext, side);
    let (key, iv) = derive_message_keys(crypto, auth_key, &msg_key, side);
    crypto.aes_ige_encrypt(&mut plaintext, &key, &iv)?;

    let mut out = Vec::with_capacity(24 + plaintext.len());
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&msg_key);
    out.extend_from_slice(&plaintext);
    Ok(out)
}

/// Decrypt `key_id ‖ msg_key ‖ ciphertext` produced by `side`, in place.
///
/// On success returns the plaintext (still including padding). Checks the key
/// id before decrypting and the message key afterwards; the inner header is
/// left to the session layer.
pub fn decrypt_message<'a>(
    crypto: &dyn CryptoProvider,
    auth_key: &AuthKey,
    side: Side,
    buffer: &'a mut [u8],
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 + 32 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = derive_message_keys(crypto, auth_key, &msg_key, side);
    crypto
        .aes_ige_decrypt(&mut buffer[24..], &key, &iv)
        .map_err(|_| DecryptError::InvalidBuffer)?;

    if compute_msg_key(crypto, auth_key, &buffer[24..], side) != msg_key {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}
