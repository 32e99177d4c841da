//! hconn-chan: channel and socket-bootstrap bridge for the hconn HTTP
//! connection manager.
//!
//! # Architecture
//!
//! This crate is the seam between sockets and protocol handlers:
//!
//! ## Channels and slots
//! - A channel is an ordered chain of slots, each holding a handler
//! - Read messages flow from the socket end toward the application end,
//!   write messages flow the opposite way
//! - Every channel owns exactly ONE event-loop task; handler execution and
//!   per-connection loop state are serialized onto it via `schedule_task`
//!
//! ## Lifetime
//! - Channel lifetime is a hold count, not an `Arc` strong count: the
//!   creator holds one hold (returned when shutdown completes), upper
//!   layers take more while they reference the channel
//! - The final hold destroys the slots, dropping their handlers, and stops
//!   the event loop
//!
//! ## Bootstrap
//! - `new_socket_channel` connects one outbound TCP socket and reports the
//!   resulting channel through a setup callback
//! - `new_socket_listener` accepts inbound sockets, producing one channel
//!   per accept; `destroy_socket_listener` fires its destroy callback only
//!   after every accepted channel has finished shutting down
//!
//! All payloads are `bytes::Bytes`; no copies are made between the socket
//! pumps and handlers.

pub mod bootstrap;
pub mod channel;
pub mod error;
pub mod socket;

pub use bootstrap::{
    channel_from_stream, destroy_socket_listener, new_socket_channel, new_socket_listener,
    Bootstrap, Listener, OnChannelSetup, OnChildChannelShutdown, OnIncomingChannel,
    OnListenerDestroy, ServerListenerOptions, SocketChannelOptions,
};
pub use channel::{
    Channel, ChannelHandler, ChannelOptions, ChannelStatsSample, HandlerRef, Message,
    OnChannelShutdown, Slot, StatisticsHandler,
};
pub use error::ChannelError;
pub use socket::{SocketOptions, TlsConnectionOptions};
