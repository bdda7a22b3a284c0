//! SOCKS5 proxy connector.
//!
//! Attach a [`Socks5Config`] to [`crate::Config`] and every DC connection is
//! tunnelled through the proxy:
//!
//! ```rust,no_run
//! use mtlink_client::{Config, Socks5Config};
//!
//! let cfg = Config {
//!     socks5: Some(Socks5Config::new("127.0.0.1:1080")),
//!     ..Default::default()
//! };
//! ```

use std::io;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

/// SOCKS5 proxy configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socks5Config {
    /// `host:port` of the proxy.
    pub proxy_addr: String,
    /// Username and password, if the proxy wants them.
    pub auth: Option<(String, String)>,
}

impl Socks5Config {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self { proxy_addr: proxy_addr.into(), auth: None }
    }

    pub fn with_auth(proxy_addr: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { proxy_addr: proxy_addr.into(), auth: Some((username.into(), password.into())) }
    }

    /// Open a TCP stream to `target` through the proxy.
    pub async fn connect(&self, target: &str) -> io::Result<TcpStream> {
        tracing::debug!("[mtlink] socks5: {} -> {target}", self.proxy_addr);
        let stream = match &self.auth {
            None => Socks5Stream::connect(self.proxy_addr.as_str(), target).await,
            Some((user, pass)) => {
                Socks5Stream::connect_with_password(self.proxy_addr.as_str(), target, user, pass).await
            }
        }
        .map_err(io::Error::other)?;
        Ok(stream.into_inner())
    }
}
