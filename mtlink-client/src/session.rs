//! Portable string sessions.
//!
//! A string session packs everything needed to resume an authorized
//! session elsewhere into one URL-safe base64 string:
//!
//! ```text
//! version:u8 (= 3) | flags:int | bytes(main DC) | [bytes(media DC)] | [self] | bytes(auth key)
//! ```
//!
//! `flags & 1` marks the self block (`long user_id`, `Bool is_bot`),
//! `flags & 4` a media DC different from the main one. A DC option is the
//! byte string `[1, dc_id, ipv6 | media << 1 | test << 2] + string(ip) + int(port)`.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mtlink_tl_types::deserialize::{Cursor, Deserializable};
use mtlink_tl_types::Serializable;

use crate::config::DcOption;
use crate::errors::InvocationError;
use crate::storage::{SelfInfo, StoredDcs};

const VERSION: u8 = 3;
const DC_OPTION_VERSION: u8 = 1;

const FLAG_SELF: i32 = 1;
const FLAG_TEST_MODE_OLD: i32 = 2;
const FLAG_MEDIA: i32 = 4;

/// Decoded contents of a string session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringSession {
    pub dcs: StoredDcs,
    pub self_info: Option<SelfInfo>,
    pub auth_key: Vec<u8>,
}

fn invalid(what: &str) -> InvocationError { InvocationError::Argument(format!("invalid session string ({what})")) }

fn serialize_dc_option(dc: &DcOption) -> Vec<u8> {
    let flags = dc.ipv6 as u8 | (dc.media_only as u8) << 1 | (dc.test_mode as u8) << 2;
    let mut out = vec![DC_OPTION_VERSION, dc.id as u8, flags];
    dc.ip_address.as_str().serialize(&mut out);
    (dc.port as i32).serialize(&mut out);
    out
}

fn parse_dc_option(data: &[u8]) -> Option<DcOption> {
    let mut cur = Cursor::from_slice(data);
    if cur.read_byte().ok()? != DC_OPTION_VERSION {
        return None;
    }
    let id = cur.read_byte().ok()? as i32;
    let flags = cur.read_byte().ok()?;
    let ip_address = String::deserialize(&mut cur).ok()?;
    let port = u16::try_from(i32::deserialize(&mut cur).ok()?).ok()?;
    Some(DcOption {
        id,
        ip_address,
        port,
        ipv6: flags & 1 != 0,
        media_only: flags & 2 != 0,
        test_mode: flags & 4 != 0,
        ..Default::default()
    })
}

impl StringSession {
    pub fn encode(&self) -> String {
        let has_media = self.dcs.media != self.dcs.main;
        let mut flags = 0;
        if self.self_info.is_some() {
            flags |= FLAG_SELF;
        }
        if has_media {
            flags |= FLAG_MEDIA;
        }

        let mut out = vec![VERSION];
        flags.serialize(&mut out);
        serialize_dc_option(&self.dcs.main).serialize(&mut out);
        if has_media {
            serialize_dc_option(&self.dcs.media).serialize(&mut out);
        }
        if let Some(me) = &self.self_info {
            me.user_id.serialize(&mut out);
            me.is_bot.serialize(&mut out);
        }
        self.auth_key.serialize(&mut out);
        URL_SAFE_NO_PAD.encode(out)
    }

    pub fn decode(s: &str) -> Result<Self, InvocationError> {
        let buf = URL_SAFE_NO_PAD.decode(s.trim().trim_end_matches('=')).map_err(|_| invalid("not base64"))?;
        let (&version, rest) = buf.split_first().ok_or_else(|| invalid("empty"))?;
        if version != VERSION {
            return Err(InvocationError::Argument(format!("unsupported session string version {version}")));
        }

        let mut cur = Cursor::from_slice(rest);
        let truncated = |_: mtlink_tl_types::deserialize::Error| invalid("truncated");
        let flags = i32::deserialize(&mut cur).map_err(truncated)?;

        let mut main = parse_dc_option(&Vec::<u8>::deserialize(&mut cur).map_err(truncated)?)
            .ok_or_else(|| invalid("bad main DC"))?;
        let mut media = if flags & FLAG_MEDIA != 0 {
            parse_dc_option(&Vec::<u8>::deserialize(&mut cur).map_err(truncated)?)
                .ok_or_else(|| invalid("bad media DC"))?
        } else {
            main.clone()
        };
        if flags & FLAG_TEST_MODE_OLD != 0 {
            main.test_mode = true;
            media.test_mode = true;
        } else if main.test_mode != media.test_mode {
            return Err(invalid("main and media DC disagree on test mode"));
        }

        let self_info = if flags & FLAG_SELF != 0 {
            let user_id = i64::deserialize(&mut cur).map_err(truncated)?;
            let is_bot = bool::deserialize(&mut cur).map_err(|_| invalid("bad self"))?;
            Some(SelfInfo { user_id, is_bot })
        } else {
            None
        };

        let auth_key = Vec::<u8>::deserialize(&mut cur).map_err(truncated)?;
        if auth_key.len() != 256 {
            return Err(invalid("auth key is not 256 bytes"));
        }
        Ok(Self { dcs: StoredDcs { main, media }, self_info, auth_key })
    }
}
