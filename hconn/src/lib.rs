//! hconn: HTTP connection lifecycle management over an asynchronous
//! channel abstraction.
//!
//! This crate turns freshly established byte channels (from
//! [`hconn_chan`]) into protocol-aware, reference-counted HTTP connection
//! objects, multiplexes them onto per-connection worker state, and tears
//! them down cleanly on shutdown.
//!
//! # Architecture
//!
//! - `connection::factory` — builds the right connection object for a
//!   channel, choosing HTTP/1.1 or HTTP/2 from the TLS handler's
//!   negotiated ALPN, and splices it into the channel as a handler
//! - `server` — owns a listening socket, tracks every live child
//!   connection, and orchestrates graceful shutdown
//! - `client` — initiates one outbound channel per `connect` and maps the
//!   channel's setup/shutdown callbacks onto the user-facing connection
//!   lifecycle
//! - `connection` — the abstract connection handle and the HTTP/1.1 and
//!   HTTP/2 implementations behind it
//! - `hooks` — the process-wide, swappable socket-channel factory used for
//!   test injection
//!
//! Every connection is bound to exactly one channel event-loop task; state
//! touched off that task is confined to small lock-protected blocks.

pub mod client;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod monitor;
pub mod proxy;
pub mod request;
pub mod server;

pub use client::{
    connect, ClientConnectionOptions, OnClientConnectionSetup, OnClientConnectionShutdown,
};
pub use connection::h1::Http1Connection;
pub use connection::h1_stream::{
    ClientStreamOptions, H1Stream, OnStreamComplete, RequestHandlerOptions, StreamPhase,
};
pub use connection::h2::{
    Goaway, Http2Connection, Http2ConnectionOptions, Http2Setting, Http2SettingId, OnPingAck,
    OnSettingsComplete, HTTP2_PING_DATA_SIZE, HTTP2_SETTINGS_COUNT,
};
pub use connection::{
    Connection, HttpVersion, OnIncomingRequest, OnServerConnectionShutdown,
    ServerConnectionOptions, UserData, MAX_STREAM_ID,
};
pub use error::HttpError;
pub use hooks::{reset_system_vtable, set_system_vtable, SystemVtable};
pub use monitor::MonitoringOptions;
pub use proxy::{ProxyOptions, ProxyRequestTransform};
pub use request::{Header, Request};
pub use server::{
    Endpoint, HttpServer, HttpServerOptions, OnIncomingConnection, OnServerDestroyComplete,
};
