//! Connection objects and their shared core.
//!
//! A [`Connection`] is the user-facing handle over one of two concrete
//! protocol implementations, [`Http1Connection`] or [`Http2Connection`].
//! Callers hold the abstract handle; HTTP/2-only operations are methods on
//! the concrete HTTP/2 capability, reachable through [`Connection::http2`],
//! and the abstract handle retains the runtime version check so a
//! wrong-version call fails with `InvalidState` instead of dispatching.
//!
//! Lifetime is a joint ownership between the user (explicit reference
//! count, [`Connection::acquire`] / [`Connection::release`]) and the
//! channel (the handler installed in the connection's slot). The final
//! user release requests channel shutdown and returns the connection's
//! channel hold; the channel's teardown then destroys the slot, dropping
//! the handler and finalizing the connection.

pub(crate) mod factory;
pub mod h1;
pub mod h1_stream;
pub mod h2;

use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use hconn_chan::{Channel, HandlerRef, Slot};
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::error::HttpError;
use crate::proxy::ProxyRequestTransform;

use self::h1::Http1Connection;
use self::h1_stream::H1Stream;
use self::h2::{Goaway, Http2Connection, Http2Setting, OnPingAck, OnSettingsComplete};

/// Stream ids are 31 bits.
pub const MAX_STREAM_ID: u32 = u32::MAX >> 1;

/// Protocol version spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1_1,
    Http2,
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpVersion::Http1_1 => f.write_str("HTTP/1.1"),
            HttpVersion::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// Opaque user state attached to a connection.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Server callback producing the stream that will handle an incoming
/// request. Returning `None` rejects the request and shuts the channel down.
pub type OnIncomingRequest = Arc<dyn Fn(&Connection) -> Option<Arc<H1Stream>> + Send + Sync>;

/// Invoked once when a server-side connection finishes shutting down.
pub type OnServerConnectionShutdown = Box<dyn FnOnce(Connection, Option<HttpError>) + Send>;

/// Options accepted by [`Connection::configure_server`].
pub struct ServerConnectionOptions {
    pub on_incoming_request: OnIncomingRequest,
    pub on_shutdown: Option<OnServerConnectionShutdown>,
    pub connection_user_data: Option<UserData>,
}

#[derive(Default)]
pub(crate) struct ClientData {
    proxy_request_transform: Mutex<Option<ProxyRequestTransform>>,
}

#[derive(Default)]
pub(crate) struct ServerData {
    config: Mutex<ServerConfigState>,
}

#[derive(Default)]
struct ServerConfigState {
    on_incoming_request: Option<OnIncomingRequest>,
    on_shutdown: Option<OnServerConnectionShutdown>,
}

pub(crate) enum RoleData {
    Client(ClientData),
    Server(ServerData),
}

/// State shared by both protocol implementations.
pub(crate) struct ConnectionCore {
    version: HttpVersion,
    refcount: AtomicUsize,
    next_stream_id: AtomicU32,
    channel: Channel,
    slot: OnceLock<Slot>,
    user_data: Mutex<Option<UserData>>,
    role: RoleData,
    self_ref: Weak<dyn ProtocolConnection>,
}

impl ConnectionCore {
    pub(crate) fn new(
        version: HttpVersion,
        channel: Channel,
        role: RoleData,
        self_ref: Weak<dyn ProtocolConnection>,
    ) -> Self {
        // Client-initiated stream ids are odd, server-initiated even.
        let seed = match role {
            RoleData::Client(_) => 1,
            RoleData::Server(_) => 2,
        };
        Self {
            version,
            refcount: AtomicUsize::new(1),
            next_stream_id: AtomicU32::new(seed),
            channel,
            slot: OnceLock::new(),
            user_data: Mutex::new(None),
            role,
            self_ref,
        }
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn slot(&self) -> Option<&Slot> {
        self.slot.get()
    }

    pub(crate) fn install_slot(&self, slot: Slot) {
        let _ = self.slot.set(slot);
    }

    pub(crate) fn role(&self) -> &RoleData {
        &self.role
    }

    /// Rebuild a user-facing handle from inside a protocol implementation.
    pub(crate) fn connection(&self) -> Option<Connection> {
        self.self_ref.upgrade().map(|proto| Connection { proto })
    }

    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "connection refcount underflow");
        if prev == 1 {
            trace!(
                channel = self.channel.id(),
                "final connection refcount released, shutting down channel"
            );
            // Channel might already be shut down, but make sure. When the
            // channel's hold count reaches zero it destroys its slots,
            // which finalizes this connection.
            self.channel.shutdown(None);
            self.channel.release_hold();
        } else {
            trace!(
                channel = self.channel.id(),
                remaining = prev - 1,
                "connection refcount released"
            );
        }
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Hand out the next stream id and advance by two. Ids are never
    /// reused; once the 31-bit space is exhausted every call fails.
    pub(crate) fn next_stream_id(&self) -> Result<u32, HttpError> {
        let mut current = self.next_stream_id.load(Ordering::Relaxed);
        loop {
            if current > MAX_STREAM_ID {
                info!(
                    channel = self.channel.id(),
                    "all available stream ids are gone"
                );
                return Err(HttpError::StreamIdsExhausted);
            }
            match self.next_stream_id.compare_exchange_weak(
                current,
                current + 2,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_next_stream_id(&self, value: u32) {
        self.next_stream_id.store(value, Ordering::Relaxed);
    }
}

/// Operations every protocol implementation provides.
pub(crate) trait ProtocolConnection: Send + Sync {
    fn core(&self) -> &ConnectionCore;
    fn close(&self);
    fn is_open(&self) -> bool;
    fn new_requests_allowed(&self) -> bool;
    fn update_window(&self, increment: usize);
    /// The handler has been bound to its slot; finalize in-channel state.
    fn on_handler_installed(&self, slot: &Slot);
    fn as_channel_handler(self: Arc<Self>) -> HandlerRef;
    fn as_http1(self: Arc<Self>) -> Option<Arc<Http1Connection>> {
        None
    }
    fn as_http2(&self) -> Option<&Http2Connection> {
        None
    }
    fn as_http2_arc(self: Arc<Self>) -> Option<Arc<Http2Connection>> {
        None
    }
}

/// User-facing handle to an HTTP connection.
///
/// Cloning copies the handle without touching the reference count; use
/// [`Connection::acquire`] and [`Connection::release`] to express
/// ownership, exactly one `release` per acquired reference.
#[derive(Clone)]
pub struct Connection {
    pub(crate) proto: Arc<dyn ProtocolConnection>,
}

impl Connection {
    pub fn version(&self) -> HttpVersion {
        self.proto.core().version
    }

    pub fn is_client(&self) -> bool {
        matches!(self.proto.core().role, RoleData::Client(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self.proto.core().role, RoleData::Server(_))
    }

    pub fn channel(&self) -> Channel {
        self.proto.core().channel.clone()
    }

    pub fn host_address(&self) -> Option<String> {
        self.proto.core().channel.host_address().map(str::to_owned)
    }

    /// Take an additional reference on the connection.
    pub fn acquire(&self) {
        self.proto.core().acquire();
    }

    /// Return a reference. The final release requests channel shutdown.
    pub fn release(&self) {
        self.proto.core().release();
    }

    /// Current reference count. Exposed for diagnostics and tests.
    pub fn ref_count(&self) -> usize {
        self.proto.core().refcount()
    }

    /// Begin shutting the connection down. Idempotent.
    pub fn close(&self) {
        self.proto.close();
    }

    pub fn is_open(&self) -> bool {
        self.proto.is_open()
    }

    pub fn new_requests_allowed(&self) -> bool {
        self.proto.new_requests_allowed()
    }

    /// Enlarge the inbound read window by `increment` bytes.
    pub fn update_window(&self, increment: usize) {
        self.proto.update_window(increment);
    }

    pub fn next_stream_id(&self) -> Result<u32, HttpError> {
        self.proto.core().next_stream_id()
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.proto.core().user_data.lock().clone()
    }

    pub(crate) fn set_user_data(&self, data: Option<UserData>) {
        *self.proto.core().user_data.lock() = data;
    }

    /// Configure a server-role connection from inside the server's
    /// `on_incoming_connection` callback. Legal exactly once.
    pub fn configure_server(&self, options: ServerConnectionOptions) -> Result<(), HttpError> {
        let server = match &self.proto.core().role {
            RoleData::Server(data) => data,
            RoleData::Client(_) => {
                warn!(
                    channel = self.channel().id(),
                    "server-only function invoked on client, ignoring call"
                );
                return Err(HttpError::InvalidState(
                    "server-only function invoked on client connection",
                ));
            }
        };
        {
            let mut config = server.config.lock();
            if config.on_incoming_request.is_some() {
                warn!(
                    channel = self.channel().id(),
                    "connection is already configured, ignoring call"
                );
                return Err(HttpError::InvalidState("connection is already configured"));
            }
            config.on_incoming_request = Some(options.on_incoming_request);
            config.on_shutdown = options.on_shutdown;
        }
        self.set_user_data(options.connection_user_data);
        Ok(())
    }

    pub(crate) fn is_server_configured(&self) -> bool {
        match &self.proto.core().role {
            RoleData::Server(data) => data.config.lock().on_incoming_request.is_some(),
            RoleData::Client(_) => false,
        }
    }

    pub(crate) fn server_on_incoming_request(&self) -> Option<OnIncomingRequest> {
        match &self.proto.core().role {
            RoleData::Server(data) => data.config.lock().on_incoming_request.clone(),
            RoleData::Client(_) => None,
        }
    }

    pub(crate) fn take_server_on_shutdown(&self) -> Option<OnServerConnectionShutdown> {
        match &self.proto.core().role {
            RoleData::Server(data) => data.config.lock().on_shutdown.take(),
            RoleData::Client(_) => None,
        }
    }

    pub(crate) fn set_proxy_request_transform(&self, transform: Option<ProxyRequestTransform>) {
        if let RoleData::Client(data) = &self.proto.core().role {
            *data.proxy_request_transform.lock() = transform;
        }
    }

    /// The proxy transform applied to outgoing requests, if any.
    pub fn proxy_request_transform(&self) -> Option<ProxyRequestTransform> {
        match &self.proto.core().role {
            RoleData::Client(data) => data.proxy_request_transform.lock().clone(),
            RoleData::Server(_) => None,
        }
    }

    /// The concrete HTTP/1.1 capability.
    pub fn http1(&self) -> Result<Arc<Http1Connection>, HttpError> {
        self.proto.clone().as_http1().ok_or_else(|| {
            warn!(
                channel = self.channel().id(),
                "HTTP/1.1 only function invoked on connection with another protocol, ignoring call"
            );
            HttpError::InvalidState("connection does not speak HTTP/1.1")
        })
    }

    /// The concrete HTTP/2 capability.
    pub fn http2(&self) -> Result<&Http2Connection, HttpError> {
        match self.proto.as_http2() {
            Some(h2) => Ok(h2),
            None => {
                warn!(
                    channel = self.channel().id(),
                    "HTTP/2 only function invoked on connection with another protocol, ignoring call"
                );
                Err(HttpError::InvalidState(
                    "connection does not speak HTTP/2",
                ))
            }
        }
    }

    // HTTP/2-only operations, version-checked before dispatch.

    pub fn change_settings(
        &self,
        settings: &[Http2Setting],
        on_completed: Option<OnSettingsComplete>,
    ) -> Result<(), HttpError> {
        self.http2()?.change_settings(settings, on_completed)
    }

    pub fn ping(
        &self,
        opaque_data: Option<&[u8]>,
        on_ack: Option<OnPingAck>,
    ) -> Result<(), HttpError> {
        self.http2()?.ping(opaque_data, on_ack)
    }

    pub fn send_goaway(
        &self,
        http2_error: u32,
        allow_more_streams: bool,
        debug_data: Option<Bytes>,
    ) -> Result<(), HttpError> {
        self.http2()?
            .send_goaway(http2_error, allow_more_streams, debug_data)
    }

    pub fn sent_goaway(&self) -> Result<Goaway, HttpError> {
        self.http2()?.sent_goaway()
    }

    pub fn received_goaway(&self) -> Result<Goaway, HttpError> {
        self.http2()?.received_goaway()
    }

    pub fn local_settings(&self) -> Result<Vec<Http2Setting>, HttpError> {
        Ok(self.http2()?.local_settings())
    }

    pub fn remote_settings(&self) -> Result<Vec<Http2Setting>, HttpError> {
        Ok(self.http2()?.remote_settings())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.version())
            .field("channel", &self.proto.core().channel.id())
            .field("client", &self.is_client())
            .finish()
    }
}
