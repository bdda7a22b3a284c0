//! The crypto capability object.
//!
//! Every component that hashes, encrypts or draws randomness receives an
//! `Arc<dyn CryptoProvider>` at construction time. [`DefaultCryptoProvider`]
//! is backed by the RustCrypto crates and the OS random source.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::CryptoError;
use crate::aes::{Block, ige_decrypt, ige_encrypt};

/// A stateful AES-256-CTR keystream.
pub trait AesCtr: Send {
    /// XOR the next `data.len()` keystream bytes into `data`.
    fn apply(&mut self, data: &mut [u8]);
}

/// Platform crypto primitives.
pub trait CryptoProvider: Send + Sync {
    /// SHA-1 over the concatenation of `parts`.
    fn sha1(&self, parts: &[&[u8]]) -> [u8; 20];

    /// SHA-256 over the concatenation of `parts`.
    fn sha256(&self, parts: &[&[u8]]) -> [u8; 32];

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError>;

    /// PBKDF2 with HMAC-SHA512, 64 bytes of output.
    fn pbkdf2_sha512(&self, password: &[u8], salt: &[u8], rounds: u32) -> [u8; 64];

    fn aes_encrypt_block(&self, key: &[u8; 32], block: &mut Block);

    fn aes_decrypt_block(&self, key: &[u8; 32], block: &mut Block);

    /// AES-256-IGE encryption in place. `data.len()` must be a multiple of 16.
    fn aes_ige_encrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) -> Result<(), CryptoError> {
        ige_encrypt(data, iv, |b| self.aes_encrypt_block(key, b))
    }

    /// Inverse of [`aes_ige_encrypt`](Self::aes_ige_encrypt).
    fn aes_ige_decrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) -> Result<(), CryptoError> {
        ige_decrypt(data, iv, |b| self.aes_decrypt_block(key, b))
    }

    /// A fresh AES-256-CTR stream with a 128-bit big-endian counter.
    fn create_aes_ctr(&self, key: &[u8; 32], iv: &[u8; 16]) -> Box<dyn AesCtr>;

    /// Fill `buf` from a CSPRNG.
    fn random_bytes(&self, buf: &mut [u8]);

    fn random_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        self.random_bytes(&mut b);
        u64::from_le_bytes(b)
    }
}

// ─── Default provider ─────────────────────────────────────────────────────────

/// RustCrypto-backed [`CryptoProvider`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCryptoProvider;

struct Ctr(ctr::Ctr128BE<Aes256>);

impl AesCtr for Ctr {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

impl CryptoProvider for DefaultCryptoProvider {
    fn sha1(&self, parts: &[&[u8]]) -> [u8; 20] {
        let mut h = Sha1::new();
        for p in parts {
            h.update(p);
        }
        h.finalize().into()
    }

    fn sha256(&self, parts: &[&[u8]]) -> [u8; 32] {
        let mut h = Sha256::new();
        for p in parts {
            h.update(p);
        }
        h.finalize().into()
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    fn pbkdf2_sha512(&self, password: &[u8], salt: &[u8], rounds: u32) -> [u8; 64] {
        let mut out = [0u8; 64];
        pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, rounds, &mut out);
        out
    }

    fn aes_encrypt_block(&self, key: &[u8; 32], block: &mut Block) {
        Aes256::new(key.into()).encrypt_block(block.into());
    }

    fn aes_decrypt_block(&self, key: &[u8; 32], block: &mut Block) {
        Aes256::new(key.into()).decrypt_block(block.into());
    }

    // Key schedule once per message instead of once per block.
    fn aes_ige_encrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) -> Result<(), CryptoError> {
        let cipher = Aes256::new(key.into());
        ige_encrypt(data, iv, |b| cipher.encrypt_block(b.into()))
    }

    fn aes_ige_decrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) -> Result<(), CryptoError> {
        let cipher = Aes256::new(key.into());
        ige_decrypt(data, iv, |b| cipher.decrypt_block(b.into()))
    }

    fn create_aes_ctr(&self, key: &[u8; 32], iv: &[u8; 16]) -> Box<dyn AesCtr> {
        Box::new(Ctr(ctr::Ctr128BE::<Aes256>::new(key.into(), iv.into())))
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        getrandom::getrandom(buf).expect("OS random source unavailable");
    }
}
