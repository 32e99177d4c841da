//! Socket creation and configuration.
//!
//! TCP sockets are created through socket2 for fine-grained control over
//! options that tokio does not expose directly (keepalive timings, listen
//! backlog, SO_REUSEADDR).

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Options applied to every socket a bootstrap creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketOptions {
    /// Timeout for outbound connection establishment, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Enable TCP keepalive probes.
    #[serde(default)]
    pub keep_alive: bool,

    /// Idle time before the first keepalive probe, in seconds.
    #[serde(default)]
    pub keep_alive_interval_secs: Option<u64>,

    /// Disable Nagle's algorithm.
    #[serde(default = "default_no_delay")]
    pub no_delay: bool,
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_no_delay() -> bool {
    true
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive: false,
            keep_alive_interval_secs: None,
            no_delay: default_no_delay(),
        }
    }
}

impl SocketOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be non-zero".to_string());
        }
        if self.keep_alive_interval_secs == Some(0) {
            return Err("keep_alive_interval_secs must be non-zero when set".to_string());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// TLS parameters threaded through to whichever component provides the TLS
/// handler. The channel layer itself performs no transport security.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConnectionOptions {
    /// SNI server name.
    pub server_name: String,
    /// ALPN protocols to offer, in preference order.
    #[serde(default)]
    pub alpn_list: Vec<String>,
}

/// Apply per-stream options to a connected socket.
pub(crate) fn configure_stream(stream: &TcpStream, options: &SocketOptions) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(options.no_delay)?;
    if options.keep_alive {
        let mut keepalive = TcpKeepalive::new();
        if let Some(secs) = options.keep_alive_interval_secs {
            keepalive = keepalive.with_time(Duration::from_secs(secs));
        }
        sock.set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Create a listening TCP socket bound to `addr`.
///
/// Built with socket2 so SO_REUSEADDR and the backlog are set before the
/// socket is handed to tokio.
pub(crate) fn bind_tcp_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
