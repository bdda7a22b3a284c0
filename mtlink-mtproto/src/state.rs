//! Per-session sequencing and envelope encryption.

use std::sync::Arc;

use mtlink_crypto::{AuthKey, CryptoProvider, Side, decrypt_message, encrypt_message};

use crate::SessionError;
use crate::lru::LruCache;
use crate::message::{MsgIdGenerator, OutgoingMessage};

const RECENT_INCOMING: usize = 1000;

/// The inner header and body of a decrypted server message.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingMessage {
    pub salt: i64,
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// Session id, message id and seqno allocation, and the encrypted envelope.
///
/// One instance per DC connection; it is the only place ids are assigned,
/// so outgoing ids are strictly increasing for the connection.
pub struct SessionState {
    crypto: Arc<dyn CryptoProvider>,
    auth_key: AuthKey,
    session_id: i64,
    seq: i32,
    msg_ids: MsgIdGenerator,
    recent_incoming: LruCache<i64, ()>,
}

impl SessionState {
    pub fn new(crypto: Arc<dyn CryptoProvider>, auth_key: AuthKey) -> Self {
        let session_id = crypto.random_u64() as i64;
        Self {
            crypto,
            auth_key,
            session_id,
            seq: 0,
            msg_ids: MsgIdGenerator::new(),
            recent_incoming: LruCache::new(RECENT_INCOMING),
        }
    }

    pub fn session_id(&self) -> i64 { self.session_id }

    pub fn auth_key(&self) -> &AuthKey { &self.auth_key }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> { &self.crypto }

    pub fn time_offset(&self) -> i32 { self.msg_ids.time_offset() }

    pub fn set_time_offset(&mut self, offset: i32) { self.msg_ids.set_time_offset(offset); }

    pub fn sync_time(&mut self, server_msg_id: i64, now_ms: i64) {
        self.msg_ids.sync_with_server(server_msg_id, now_ms);
    }

    /// Start a new session: fresh id, seqno and msg_id floor back to zero,
    /// dedup window cleared.
    pub fn reset(&mut self) {
        self.session_id = self.crypto.random_u64() as i64;
        self.seq = 0;
        self.msg_ids.reset();
        self.recent_incoming.clear();
        log::debug!("session reset, new session_id = {:016x}", self.session_id);
    }

    pub fn next_msg_id(&mut self, now_ms: i64) -> i64 {
        let mut rnd = [0u8; 2];
        self.crypto.random_bytes(&mut rnd);
        self.msg_ids.next(now_ms, u16::from_le_bytes(rnd))
    }

    /// Content-related messages get `2n + 1` and advance `n`; all others get
    /// `2n` and leave it alone.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.seq * 2 + 1;
            self.seq += 1;
            n
        } else {
            self.seq * 2
        }
    }

    /// Assign a fresh id and seqno to `body`.
    pub fn wrap(&mut self, body: Vec<u8>, content_related: bool, now_ms: i64) -> OutgoingMessage {
        let msg_id = self.next_msg_id(now_ms);
        let seq_no = self.next_seq_no(content_related);
        OutgoingMessage { msg_id, seq_no, body }
    }

    /// Encrypt one message (possibly a container) for the wire.
    pub fn encrypt(&self, msg: &OutgoingMessage, salt: i64) -> Result<Vec<u8>, SessionError> {
        let mut plain = Vec::with_capacity(32 + msg.body.len());
        plain.extend_from_slice(&salt.to_le_bytes());
        plain.extend_from_slice(&self.session_id.to_le_bytes());
        plain.extend_from_slice(&msg.msg_id.to_le_bytes());
        plain.extend_from_slice(&msg.seq_no.to_le_bytes());
        plain.extend_from_slice(&(msg.body.len() as u32).to_le_bytes());
        plain.extend_from_slice(&msg.body);
        Ok(encrypt_message(self.crypto.as_ref(), &self.auth_key, Side::Client, plain)?)
    }

    /// Decrypt and validate a server frame.
    pub fn decrypt(&self, frame: &mut [u8]) -> Result<IncomingMessage, SessionError> {
        let plain = decrypt_message(self.crypto.as_ref(), &self.auth_key, Side::Server, frame)?;

        let le_i64 = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&plain[at..at + 8]);
            i64::from_le_bytes(b)
        };
        let salt = le_i64(0);
        let session_id = le_i64(8);
        let msg_id = le_i64(16);
        let seq_no = i32::from_le_bytes([plain[24], plain[25], plain[26], plain[27]]);
        let length = u32::from_le_bytes([plain[28], plain[29], plain[30], plain[31]]) as usize;

        if session_id != self.session_id {
            return Err(SessionError::SessionMismatch { got: session_id });
        }
        if length > plain.len() - 32 || length % 4 != 0 {
            return Err(SessionError::InvalidLength(length));
        }
        let padding = plain.len() - 32 - length;
        if !(12..=1024).contains(&padding) {
            return Err(SessionError::InvalidPadding(padding));
        }

        Ok(IncomingMessage { salt, msg_id, seq_no, body: plain[32..32 + length].to_vec() })
    }

    /// Record an incoming id. Returns `false` for ids that must be ignored:
    /// even ones (server ids are odd) and ones already seen.
    pub fn register_incoming(&mut self, msg_id: i64) -> bool {
        if msg_id % 2 == 0 {
            log::warn!("ignoring message with even msg_id {msg_id}");
            return false;
        }
        if self.recent_incoming.contains(&msg_id) {
            log::warn!("ignoring duplicate message {msg_id}");
            return false;
        }
        self.recent_incoming.put(msg_id, ());
        true
    }

    pub fn was_received(&self, msg_id: i64) -> bool { self.recent_incoming.contains(&msg_id) }
}
