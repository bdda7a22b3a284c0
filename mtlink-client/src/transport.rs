//! Byte streams to DCs and the framing spoken over them.
//!
//! A [`Transport`] opens a raw duplex stream to a DC address; a
//! [`TransportKind`] decides how packets are framed on it. Keeping the two
//! apart lets tests swap TCP for an in-memory pipe.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mtlink_crypto::CryptoProvider;
use mtlink_mtproto::{AbridgedCodec, IntermediateCodec, MtProxyInfo, ObfuscatedCodec, PacketCodec};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::DcOption;
use crate::pipeline::BoxFuture;
use crate::socks5::Socks5Config;

// ─── TransportKind ────────────────────────────────────────────────────────────

/// Which framing to use for every connection.
///
/// | Variant | Tag | Notes |
/// |---------|-----|-------|
/// | `Abridged` | `0xef` | Smallest overhead |
/// | `Intermediate` | `0xeeeeeeee` | Default, 4-byte length prefix |
/// | `Obfuscated` | random 64B | Intermediate under AES-CTR, for MTProxy and DPI |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    Abridged,
    #[default]
    Intermediate,
    /// `secret` is the MTProxy secret, or `None` for keyless obfuscation.
    Obfuscated { secret: Option<Vec<u8>> },
}

impl TransportKind {
    /// A fresh codec for one connection to `dc`.
    pub fn codec(&self, dc: &DcOption, crypto: Arc<dyn CryptoProvider>) -> Box<dyn PacketCodec> {
        match self {
            Self::Abridged => Box::new(AbridgedCodec::new()),
            Self::Intermediate => Box::new(IntermediateCodec::new()),
            Self::Obfuscated { secret } => {
                let proxy = secret.as_ref().map(|s| MtProxyInfo {
                    dc_id: dc.id as i16,
                    secret: s.clone(),
                    test: dc.test_mode,
                    media: dc.media_only,
                });
                Box::new(ObfuscatedCodec::new(Box::new(IntermediateCodec::new()), crypto, proxy))
            }
        }
    }
}

// ─── Transport ────────────────────────────────────────────────────────────────

/// A connected duplex byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Opens streams to DCs.
pub trait Transport: Send + Sync {
    fn connect<'a>(&'a self, dc: &'a DcOption) -> BoxFuture<'a, io::Result<Box<dyn Stream>>>;
}

/// Plain TCP, optionally through a SOCKS5 proxy.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    pub socks5: Option<Socks5Config>,
    pub connect_timeout: Duration,
    /// TCP keepalive idle time; `None` leaves the OS default.
    pub keepalive: Option<Duration>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self { socks5: None, connect_timeout: Duration::from_secs(10), keepalive: Some(Duration::from_secs(30)) }
    }
}

impl TcpTransport {
    pub fn new(socks5: Option<Socks5Config>) -> Self { Self { socks5, ..Default::default() } }

    async fn open(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = match &self.socks5 {
            Some(proxy) => proxy.connect(addr).await?,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(stream)
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(&'a self, dc: &'a DcOption) -> BoxFuture<'a, io::Result<Box<dyn Stream>>> {
        Box::pin(async move {
            let addr = dc.addr();
            tracing::info!("[mtlink] connecting to DC{} at {addr}", dc.id);
            let stream = tokio::time::timeout(self.connect_timeout, self.open(&addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {addr} timed out")))??;
            Ok(Box::new(stream) as Box<dyn Stream>)
        })
    }
}
