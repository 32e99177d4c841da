//! HTTP/1 request/response streams.
//!
//! A stream is one request/response exchange on an HTTP/1 connection.
//! Client streams are created from a request and submitted to the
//! connection with [`H1Stream::activate`]; server streams are created by
//! the connection when a request arrives and configured by the
//! request-handler callback.
//!
//! A stream's reference count starts at 2: one for the user and one for
//! the connection, returned when the connection is done with the stream.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::HttpError;
use crate::request::Request;

use super::h1::Http1Connection;
use super::{ProtocolConnection, UserData};

/// Invoked once when the stream completes, successfully or not.
pub type OnStreamComplete = Box<dyn FnOnce(&H1Stream, Option<HttpError>) + Send>;

/// Lifecycle phase of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Created, not yet worked on by the connection.
    Pending,
    /// Being written and/or decoded.
    Active,
    /// Finished cleanly.
    Done,
    /// Finished with an error.
    Errored,
}

/// Options for a client request stream.
pub struct ClientStreamOptions {
    pub request: Request,
    pub on_complete: Option<OnStreamComplete>,
    pub user_data: Option<UserData>,
    pub manual_window_management: bool,
}

/// Options applied to a server request-handler stream.
pub struct RequestHandlerOptions {
    pub on_complete: Option<OnStreamComplete>,
    pub user_data: Option<UserData>,
    pub manual_window_management: bool,
}

struct H1StreamState {
    phase: StreamPhase,
    /// Pre-validated outgoing message payload, drained by the connection's
    /// outgoing-stream task.
    outgoing: Bytes,
    outgoing_written: usize,
    incoming: BytesMut,
    write_complete: bool,
    read_complete: bool,
}

pub struct H1Stream {
    owning: Arc<Http1Connection>,
    refcount: AtomicUsize,
    id: OnceLock<u32>,
    manual_window_management: bool,
    activated: AtomicBool,
    configured: AtomicBool,
    user_data: Mutex<Option<UserData>>,
    on_complete: Mutex<Option<OnStreamComplete>>,
    state: Mutex<H1StreamState>,
}

impl H1Stream {
    fn new_common(
        connection: &Arc<Http1Connection>,
        outgoing: Bytes,
        manual_window_management: bool,
    ) -> Arc<H1Stream> {
        // The connection's hold on the stream is matched by the stream's
        // reference on the connection.
        connection.core().acquire();
        Arc::new(H1Stream {
            owning: Arc::clone(connection),
            refcount: AtomicUsize::new(2),
            id: OnceLock::new(),
            manual_window_management,
            activated: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            user_data: Mutex::new(None),
            on_complete: Mutex::new(None),
            state: Mutex::new(H1StreamState {
                phase: StreamPhase::Pending,
                outgoing,
                outgoing_written: 0,
                incoming: BytesMut::new(),
                write_complete: false,
                read_complete: false,
            }),
        })
    }

    /// Create a client request stream. The request is validated up front and
    /// its payload cached for the encoder. On a proxied connection the
    /// request transform rewrites the request first.
    pub fn new_request(
        connection: &Arc<Http1Connection>,
        mut options: ClientStreamOptions,
    ) -> Result<Arc<H1Stream>, HttpError> {
        if !connection.is_client() {
            return Err(HttpError::InvalidState(
                "client request stream on server connection",
            ));
        }
        if let Some(handle) = connection.core().connection() {
            if let Some(transform) = handle.proxy_request_transform() {
                transform(&mut options.request)?;
            }
        }
        let outgoing = outgoing_message_from_request(&options.request)?;
        let stream = Self::new_common(connection, outgoing, options.manual_window_management);
        *stream.user_data.lock() = options.user_data;
        *stream.on_complete.lock() = options.on_complete;
        Ok(stream)
    }

    /// Create a server-side stream for an incoming request. Only legal while
    /// the connection accepts request-handler streams.
    pub fn new_request_handler(
        connection: &Arc<Http1Connection>,
    ) -> Result<Arc<H1Stream>, HttpError> {
        if connection.is_client() {
            return Err(HttpError::InvalidState(
                "request-handler stream on client connection",
            ));
        }
        if !connection.can_create_request_handler_stream() {
            return Err(HttpError::InvalidState(
                "connection no longer accepts request-handler streams",
            ));
        }
        Ok(Self::new_common(connection, Bytes::new(), false))
    }

    /// Attach callbacks and user data to a request-handler stream.
    pub fn configure_request_handler(&self, options: RequestHandlerOptions) {
        *self.user_data.lock() = options.user_data;
        *self.on_complete.lock() = options.on_complete;
        self.configured.store(true, Ordering::Release);
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub fn manual_window_management(&self) -> bool {
        self.manual_window_management
    }

    /// Stream id, assigned at activation.
    pub fn id(&self) -> Option<u32> {
        self.id.get().copied()
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.lock().phase
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().clone()
    }

    pub fn connection(&self) -> &Arc<Http1Connection> {
        &self.owning
    }

    /// Grow the receive window; delegates to the owning connection.
    pub fn update_window(&self, increment: usize) {
        ProtocolConnection::update_window(&*self.owning, increment);
    }

    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Return a reference. The final release returns the stream's reference
    /// on the owning connection.
    pub fn release(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "stream refcount underflow");
        if prev == 1 {
            self.owning.core().release();
        }
    }

    /// Submit a client stream to its connection. The stream is assigned its
    /// id here and queued for the outgoing-stream task; activating an
    /// already-active stream is a no-op.
    pub fn activate(self: &Arc<Self>) -> Result<(), HttpError> {
        {
            let state = self.state.lock();
            match state.phase {
                StreamPhase::Pending => {}
                StreamPhase::Active => return Ok(()),
                StreamPhase::Done | StreamPhase::Errored => {
                    return Err(HttpError::InvalidState("stream already completed"))
                }
            }
        }
        if self.activated.swap(true, Ordering::AcqRel) {
            // A second activation rides the first.
            return Ok(());
        }

        let id = match self.owning.core().next_stream_id() {
            Ok(id) => id,
            Err(err) => {
                self.fail_activation();
                return Err(err);
            }
        };
        let _ = self.id.set(id);

        match self.owning.submit_client_stream(self) {
            Ok(()) => {
                trace!(stream = id, "stream activated");
                Ok(())
            }
            Err(err) => {
                self.fail_activation();
                Err(err)
            }
        }
    }

    /// Return the connection's hold on a stream that can never be worked
    /// on. The phase is made terminal first so `complete` cannot fire and
    /// return the hold a second time.
    fn fail_activation(&self) {
        self.state.lock().phase = StreamPhase::Errored;
        self.release();
    }

    /// Snapshot of the bytes received for this stream so far.
    pub fn incoming_body(&self) -> Bytes {
        let state = self.state.lock();
        Bytes::copy_from_slice(&state.incoming)
    }

    /// Signal from the decoder that the incoming message is complete.
    pub fn finish_incoming(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.read_complete {
                return;
            }
            state.read_complete = true;
        }
        let connection = Arc::clone(&self.owning);
        let stream = Arc::clone(self);
        self.owning.core().channel().schedule_task("http1-incoming-stream-done", move || {
            connection.on_incoming_stream_finished(&stream);
        });
    }

    pub(crate) fn mark_active(&self) {
        let mut state = self.state.lock();
        if state.phase == StreamPhase::Pending {
            state.phase = StreamPhase::Active;
        }
    }

    pub(crate) fn append_incoming(&self, data: &Bytes) {
        self.state.lock().incoming.extend_from_slice(data);
    }

    pub(crate) fn is_write_complete(&self) -> bool {
        let state = self.state.lock();
        state.write_complete || state.outgoing_written >= state.outgoing.len()
    }

    pub(crate) fn is_read_complete(&self) -> bool {
        self.state.lock().read_complete
    }

    /// Next chunk of the outgoing message, at most `max` bytes. `None` once
    /// the message is fully drained, after which the write side is complete.
    pub(crate) fn next_outgoing_chunk(&self, max: usize) -> Option<Bytes> {
        let mut state = self.state.lock();
        if state.write_complete {
            return None;
        }
        if state.outgoing_written >= state.outgoing.len() {
            state.write_complete = true;
            return None;
        }
        let end = usize::min(state.outgoing.len(), state.outgoing_written + max);
        let chunk = state.outgoing.slice(state.outgoing_written..end);
        state.outgoing_written = end;
        if end == state.outgoing.len() {
            state.write_complete = true;
        }
        Some(chunk)
    }

    /// Terminate the stream, fire its completion callback, and return the
    /// connection's hold. The phase guard makes this a no-op after the
    /// first call, so the writer and the decoder may both report the stream
    /// finished without the hold being returned twice.
    pub(crate) fn complete(&self, error: Option<HttpError>) {
        let fire = {
            let mut state = self.state.lock();
            match state.phase {
                StreamPhase::Done | StreamPhase::Errored => false,
                _ => {
                    state.phase = if error.is_some() {
                        StreamPhase::Errored
                    } else {
                        StreamPhase::Done
                    };
                    true
                }
            }
        };
        if !fire {
            return;
        }
        let on_complete = self.on_complete.lock().take();
        if let Some(on_complete) = on_complete {
            on_complete(self, error);
        }
        self.release();
    }
}

impl std::fmt::Debug for H1Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Stream")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

/// Validate a request and cache the payload the encoder will need.
fn outgoing_message_from_request(request: &Request) -> Result<Bytes, HttpError> {
    request
        .method()
        .map_err(|_| HttpError::InvalidArgument("request has no method"))?;
    request
        .path()
        .map_err(|_| HttpError::InvalidArgument("request has no path"))?;
    Ok(request.body().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hconn_chan::{Bootstrap, Channel, ChannelOptions};

    fn bare_channel() -> Channel {
        Channel::new(ChannelOptions {
            bootstrap: Bootstrap::current().unwrap(),
            host_address: None,
            on_shutdown: None,
            enable_read_back_pressure: false,
        })
    }

    fn client_options(path: &str) -> ClientStreamOptions {
        let mut request = Request::new();
        request.set_method("GET");
        request.set_path(path);
        ClientStreamOptions {
            request,
            on_complete: None,
            user_data: None,
            manual_window_management: false,
        }
    }

    #[tokio::test]
    async fn proxy_transform_rewrites_outgoing_requests() {
        let channel = bare_channel();
        let conn = Http1Connection::new_client(channel.clone(), false, 65_535);
        let handle = conn.core().connection().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.set_proxy_request_transform(Some(Arc::new(
            move |request: &mut Request| -> Result<(), HttpError> {
                let path = request.path()?.clone();
                let _ = tx.send(path.to_vec());
                request.set_path("http://origin.test:80/x");
                Ok(())
            },
        )));

        H1Stream::new_request(&conn, client_options("/x")).unwrap();
        // The transform saw the origin-form target before encoding.
        assert_eq!(rx.try_recv().unwrap(), b"/x");
        channel.shutdown(None);
    }

    #[tokio::test]
    async fn proxy_transform_failure_fails_stream_creation() {
        let channel = bare_channel();
        let conn = Http1Connection::new_client(channel.clone(), false, 65_535);
        let handle = conn.core().connection().unwrap();

        handle.set_proxy_request_transform(Some(Arc::new(
            |_request: &mut Request| -> Result<(), HttpError> {
                Err(HttpError::InvalidArgument("transform rejected the request"))
            },
        )));

        assert_eq!(
            H1Stream::new_request(&conn, client_options("/x")).unwrap_err(),
            HttpError::InvalidArgument("transform rejected the request")
        );
        channel.shutdown(None);
    }

    #[test]
    fn request_without_method_is_rejected() {
        let mut request = Request::new();
        request.set_path("/");
        assert_eq!(
            outgoing_message_from_request(&request).unwrap_err(),
            HttpError::InvalidArgument("request has no method")
        );
    }

    #[test]
    fn request_without_path_is_rejected() {
        let mut request = Request::new();
        request.set_method("GET");
        assert_eq!(
            outgoing_message_from_request(&request).unwrap_err(),
            HttpError::InvalidArgument("request has no path")
        );
    }

    #[test]
    fn validated_request_yields_its_payload() {
        let mut request = Request::new();
        request.set_method("PUT");
        request.set_path("/upload");
        request.set_body(Bytes::from_static(b"payload"));
        assert_eq!(
            outgoing_message_from_request(&request).unwrap(),
            Bytes::from_static(b"payload")
        );
    }
}
