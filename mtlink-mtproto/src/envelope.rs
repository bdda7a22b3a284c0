//! `gzip_packed` compression of outgoing bodies and inflation of incoming ones.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::write::GzEncoder;
use mtlink_tl_types::Serializable;
use mtlink_tl_types::mtproto::types::GzipPacked;

use crate::SessionError;

/// Bodies at or below this size are never compressed.
pub const GZIP_THRESHOLD: usize = 128;
/// Above this size a 1 KiB sample is compressed first to rule out
/// incompressible payloads cheaply.
pub const GZIP_SAMPLE_THRESHOLD: usize = 16384;
const SAMPLE_LEN: usize = 1024;
const GZIP_RATIO: f64 = 0.9;

fn deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    enc.write_all(data).ok()?;
    enc.finish().ok()
}

fn worth_it(original: usize, compressed: usize) -> bool {
    (compressed as f64) < original as f64 * GZIP_RATIO
}

/// Wrap `body` in `gzip_packed` when that makes it meaningfully smaller.
///
/// Returns the serialized `gzip_packed` object, or `None` if `body` should be
/// sent as is.
pub fn gzip_if_smaller(body: &[u8]) -> Option<Vec<u8>> {
    if body.len() <= GZIP_THRESHOLD {
        return None;
    }
    if body.len() > GZIP_SAMPLE_THRESHOLD {
        let start = (body.len() - SAMPLE_LEN) / 2;
        let sample = deflate(&body[start..start + SAMPLE_LEN])?;
        if !worth_it(SAMPLE_LEN, sample.len()) {
            return None;
        }
    }
    let packed = deflate(body)?;
    if !worth_it(body.len(), packed.len()) {
        return None;
    }
    Some(GzipPacked { packed_data: packed }.to_bytes())
}

/// Inflate the payload of a `gzip_packed` object.
///
/// Servers normally send gzip streams, but a raw zlib stream is accepted too.
pub fn gz_inflate(data: &[u8]) -> Result<Vec<u8>, SessionError> {
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| SessionError::Gzip(e.to_string()))?;
    Ok(out)
}
