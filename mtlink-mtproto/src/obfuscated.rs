//! The obfuscated transport wrapper.
//!
//! The first 64 bytes on the wire are random, except for the inner codec's
//! tag (and the DC id when talking to an MTProxy) hidden under AES-256-CTR
//! keyed from the random bytes themselves. Everything after that is the inner
//! codec's output run through the same keystream.

use std::sync::Arc;

use mtlink_crypto::{AesCtr, CryptoProvider};

use crate::codec::{CodecError, CodecEvent, PacketCodec};

/// First words a handshake must not start with, so it cannot be mistaken
/// for HTTP, TLS or an unobfuscated framing.
const FORBIDDEN_PREFIXES: [u32; 7] = [
    0x44414548, // HEAD
    0x54534f50, // POST
    0x20544547, // "GET "
    0x4954504f, // OPTI
    0xdddddddd, // padded intermediate
    0xeeeeeeee, // intermediate
    0x02010316, // TLS handshake
];

/// Where the connection is routed when going through an MTProxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MtProxyInfo {
    pub dc_id: i16,
    /// The secret as published: 16 bytes, or prefixed with `dd` (random
    /// padding) or `ee` (fake TLS, followed by the domain).
    pub secret: Vec<u8>,
    pub test: bool,
    pub media: bool,
}

impl MtProxyInfo {
    /// The 16 key bytes of the secret, without mode prefix or domain.
    pub fn raw_secret(&self) -> &[u8] {
        match self.secret.as_slice() {
            [0xdd, rest @ ..] if rest.len() == 16 => rest,
            [0xee, rest @ ..] if rest.len() >= 17 => &rest[..16],
            secret => secret,
        }
    }

    fn wire_dc_id(&self) -> i16 {
        let mut dc = self.dc_id;
        if self.test {
            dc += 10000;
        }
        if self.media {
            dc = -dc;
        }
        dc
    }
}

pub struct ObfuscatedCodec {
    inner: Box<dyn PacketCodec>,
    crypto: Arc<dyn CryptoProvider>,
    proxy: Option<MtProxyInfo>,
    encryptor: Option<Box<dyn AesCtr>>,
    decryptor: Option<Box<dyn AesCtr>>,
}

impl ObfuscatedCodec {
    pub fn new(inner: Box<dyn PacketCodec>, crypto: Arc<dyn CryptoProvider>, proxy: Option<MtProxyInfo>) -> Self {
        Self { inner, crypto, proxy, encryptor: None, decryptor: None }
    }

    fn random_handshake(&self) -> [u8; 64] {
        let mut random = [0u8; 64];
        loop {
            self.crypto.random_bytes(&mut random);
            if random[0] == 0xef {
                continue;
            }
            let first = u32::from_le_bytes([random[0], random[1], random[2], random[3]]);
            if FORBIDDEN_PREFIXES.contains(&first) {
                continue;
            }
            if random[4..8] == [0, 0, 0, 0] {
                continue;
            }
            return random;
        }
    }

    fn derive_key(&self, key: &[u8]) -> [u8; 32] {
        match &self.proxy {
            Some(proxy) => self.crypto.sha256(&[key, proxy.raw_secret()]),
            None => {
                let mut out = [0u8; 32];
                out.copy_from_slice(key);
                out
            }
        }
    }
}

impl PacketCodec for ObfuscatedCodec {
    fn tag(&mut self) -> Vec<u8> {
        let mut random = self.random_handshake();

        let inner_tag = self.inner.tag();
        if inner_tag.len() == 4 {
            random[56..60].copy_from_slice(&inner_tag);
        } else {
            random[56..60].fill(inner_tag.first().copied().unwrap_or(0xef));
        }
        if let Some(proxy) = &self.proxy {
            random[60..62].copy_from_slice(&proxy.wire_dc_id().to_le_bytes());
        }

        let mut reversed = [0u8; 48];
        reversed.copy_from_slice(&random[8..56]);
        reversed.reverse();

        let encrypt_key = self.derive_key(&random[8..40]);
        let decrypt_key = self.derive_key(&reversed[..32]);
        let mut encrypt_iv = [0u8; 16];
        encrypt_iv.copy_from_slice(&random[40..56]);
        let mut decrypt_iv = [0u8; 16];
        decrypt_iv.copy_from_slice(&reversed[32..48]);

        let mut encryptor = self.crypto.create_aes_ctr(&encrypt_key, &encrypt_iv);
        let decryptor = self.crypto.create_aes_ctr(&decrypt_key, &decrypt_iv);

        let mut encrypted = random;
        encryptor.apply(&mut encrypted);
        random[56..64].copy_from_slice(&encrypted[56..64]);

        self.encryptor = Some(encryptor);
        self.decryptor = Some(decryptor);
        random.to_vec()
    }

    fn encode(&mut self, packet: &[u8]) -> Result<Vec<u8>, CodecError> {
        let encryptor = self.encryptor.as_mut().ok_or(CodecError::NotReady)?;
        let mut framed = self.inner.encode(packet)?;
        encryptor.apply(&mut framed);
        Ok(framed)
    }

    fn feed(&mut self, data: &[u8]) -> Result<Vec<CodecEvent>, CodecError> {
        let decryptor = self.decryptor.as_mut().ok_or(CodecError::NotReady)?;
        let mut plain = data.to_vec();
        decryptor.apply(&mut plain);
        self.inner.feed(&plain)
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.encryptor = None;
        self.decryptor = None;
    }
}
