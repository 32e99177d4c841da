//! HTTP/1.1 connection implementation.
//!
//! The connection's state is split the same way its C-era ancestors split
//! theirs: one block only ever touched from the channel's event-loop task
//! (`thread_data`), and one lock-protected block shared with other threads
//! (`synced`). The two mutexes are never held at the same time, and neither
//! is held across a user callback or a channel-layer call.
//!
//! Two tasks do all the work, each re-armed rather than re-created:
//!
//! - the outgoing-stream task drains the stream list head-first; when one
//!   stream's message is fully written it advances to the next stream in
//!   the list without going back through the scheduler (HTTP pipelining).
//!   It is scheduled only when `is_outgoing_stream_task_active` flips from
//!   false to true.
//! - the window-update task applies read-window increments accumulated by
//!   off-thread callers. It is scheduled only when the accumulator was
//!   zero, and swaps the accumulator back to zero on the loop.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use hconn_chan::{Channel, ChannelError, ChannelHandler, HandlerRef, Message, Slot};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::HttpError;

use super::h1_stream::H1Stream;
use super::{
    ClientData, ConnectionCore, HttpVersion, ProtocolConnection, RoleData, ServerData,
};

/// Largest body slice handed to the channel in one write message.
const MAX_OUTGOING_CHUNK: usize = 16 * 1024;

/// Sequencing state for the message currently being serialized. The wire
/// encoding itself is the codec layer's job; the connection only orders
/// messages and tracks which stream owns the writer.
#[derive(Default)]
struct H1Encoder {
    current_stream_id: Option<u32>,
}

/// Sequencing state for the message currently being decoded.
#[derive(Default)]
struct H1Decoder {
    current_stream_id: Option<u32>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Http1ChannelStats {
    bytes_read: u64,
    bytes_written: u64,
}

/// State only the event-loop task may touch.
struct Http1ThreadData {
    /// Streams being worked on, in pipeline order.
    stream_list: VecDeque<Arc<H1Stream>>,
    /// Stream whose message is being written. Always a member of
    /// `stream_list`.
    outgoing_stream: Option<Arc<H1Stream>>,
    /// Stream being decoded. Always a member of `stream_list`.
    incoming_stream: Option<Arc<H1Stream>>,
    encoder: H1Encoder,
    decoder: H1Decoder,
    /// Messages received after the protocol switch, passed downstream
    /// verbatim.
    midchannel_read_messages: VecDeque<Message>,
    is_reading_stopped: bool,
    is_writing_stopped: bool,
    /// Terminal: the connection no longer services streams, it forwards.
    has_switched_protocols: bool,
    /// Server-only; request-handler streams may be created while true.
    can_create_request_handler_stream: bool,
    stats: Http1ChannelStats,
    outgoing_stream_timestamp: Option<Instant>,
    incoming_stream_timestamp: Option<Instant>,
}

/// State shared across threads, guarded by one lock.
struct Http1SyncedData {
    /// Client streams submitted but not yet adopted by the loop task.
    new_client_streams: VecDeque<Arc<H1Stream>>,
    is_outgoing_stream_task_active: bool,
    /// Mirror of the open state for callers off the loop.
    is_open: bool,
    /// When set, reject any further stream creation with this error.
    new_stream_error: Option<HttpError>,
    /// Pending read-window increment; non-zero means the window-update task
    /// is scheduled.
    window_update_size: usize,
}

pub struct Http1Connection {
    core: ConnectionCore,
    manual_window_management: bool,
    initial_window_size: usize,
    thread_data: Mutex<Http1ThreadData>,
    synced: Mutex<Http1SyncedData>,
}

impl Http1Connection {
    pub fn new_client(
        channel: Channel,
        manual_window_management: bool,
        initial_window_size: usize,
    ) -> Arc<Http1Connection> {
        Self::new(
            channel,
            manual_window_management,
            initial_window_size,
            false,
        )
    }

    pub fn new_server(
        channel: Channel,
        manual_window_management: bool,
        initial_window_size: usize,
    ) -> Arc<Http1Connection> {
        Self::new(channel, manual_window_management, initial_window_size, true)
    }

    fn new(
        channel: Channel,
        manual_window_management: bool,
        initial_window_size: usize,
        is_server: bool,
    ) -> Arc<Http1Connection> {
        Arc::new_cyclic(|weak: &Weak<Http1Connection>| {
            let self_ref: Weak<dyn ProtocolConnection> = weak.clone();
            let role = if is_server {
                RoleData::Server(ServerData::default())
            } else {
                RoleData::Client(ClientData::default())
            };
            Http1Connection {
                core: ConnectionCore::new(HttpVersion::Http1_1, channel, role, self_ref),
                manual_window_management,
                initial_window_size,
                thread_data: Mutex::new(Http1ThreadData {
                    stream_list: VecDeque::new(),
                    outgoing_stream: None,
                    incoming_stream: None,
                    encoder: H1Encoder::default(),
                    decoder: H1Decoder::default(),
                    midchannel_read_messages: VecDeque::new(),
                    is_reading_stopped: false,
                    is_writing_stopped: false,
                    has_switched_protocols: false,
                    can_create_request_handler_stream: is_server,
                    stats: Http1ChannelStats::default(),
                    outgoing_stream_timestamp: None,
                    incoming_stream_timestamp: None,
                }),
                synced: Mutex::new(Http1SyncedData {
                    new_client_streams: VecDeque::new(),
                    is_outgoing_stream_task_active: false,
                    is_open: true,
                    new_stream_error: None,
                    window_update_size: 0,
                }),
            }
        })
    }

    pub fn is_client(&self) -> bool {
        matches!(self.core.role(), RoleData::Client(_))
    }

    pub fn initial_window_size(&self) -> usize {
        self.initial_window_size
    }

    pub(crate) fn can_create_request_handler_stream(&self) -> bool {
        self.thread_data.lock().can_create_request_handler_stream
    }

    fn arc_self(&self) -> Option<Arc<Http1Connection>> {
        self.core.connection().and_then(|conn| conn.proto.as_http1())
    }

    /// Queue a freshly activated client stream for the loop task, scheduling
    /// the outgoing-stream task if it is not already armed.
    pub(crate) fn submit_client_stream(&self, stream: &Arc<H1Stream>) -> Result<(), HttpError> {
        let should_schedule = {
            let mut synced = self.synced.lock();
            if let Some(err) = &synced.new_stream_error {
                return Err(err.clone());
            }
            synced.new_client_streams.push_back(Arc::clone(stream));
            if synced.is_outgoing_stream_task_active {
                false
            } else {
                synced.is_outgoing_stream_task_active = true;
                true
            }
        };
        if should_schedule {
            self.schedule_outgoing_stream_task();
        }
        Ok(())
    }

    fn schedule_outgoing_stream_task(&self) {
        let Some(conn) = self.arc_self() else { return };
        self.core.channel().schedule_task("http1-outgoing-stream", move || {
            conn.run_outgoing_stream_task();
        });
    }

    /// Outgoing-stream pump, run on the event-loop task.
    fn run_outgoing_stream_task(self: &Arc<Self>) {
        loop {
            self.adopt_new_client_streams();
            let writing_stopped = self.pump_outgoing_streams();

            let mut synced = self.synced.lock();
            if writing_stopped || synced.new_client_streams.is_empty() {
                synced.is_outgoing_stream_task_active = false;
                return;
            }
            // More streams arrived while pumping; go around again without
            // releasing the scheduler bit.
        }
    }

    fn adopt_new_client_streams(&self) {
        let new_streams: Vec<Arc<H1Stream>> = {
            let mut synced = self.synced.lock();
            synced.new_client_streams.drain(..).collect()
        };
        if new_streams.is_empty() {
            return;
        }
        for stream in &new_streams {
            stream.mark_active();
        }
        let mut td = self.thread_data.lock();
        td.stream_list.extend(new_streams);
    }

    /// Drain stream messages head-first. Returns true when writing stopped.
    fn pump_outgoing_streams(self: &Arc<Self>) -> bool {
        let Some(slot) = self.core.slot().cloned() else {
            return true;
        };
        loop {
            if self.thread_data.lock().is_writing_stopped {
                return true;
            }
            let current = match self.take_outgoing_stream() {
                Some(stream) => stream,
                None => return false, // nothing left with data to send
            };

            let mut written: u64 = 0;
            while let Some(chunk) = current.next_outgoing_chunk(MAX_OUTGOING_CHUNK) {
                written += chunk.len() as u64;
                if let Err(err) = slot.send_write_message(Message::new(chunk)) {
                    warn!(
                        channel = self.core.channel().id(),
                        error = %err,
                        "failed to write stream message, shutting down"
                    );
                    self.thread_data.lock().is_writing_stopped = true;
                    self.core.channel().shutdown(Some(err));
                    return true;
                }
            }

            // Message fully written; advance to the next stream in the list
            // without re-entering the scheduler.
            let read_complete = current.is_read_complete();
            let (stream_id, started) = {
                let mut td = self.thread_data.lock();
                td.stats.bytes_written += written;
                let stream_id = td.encoder.current_stream_id.take();
                td.outgoing_stream = None;
                let started = td.outgoing_stream_timestamp.take();
                if read_complete {
                    td.stream_list.retain(|s| !Arc::ptr_eq(s, &current));
                }
                (stream_id, started)
            };
            trace!(
                stream = ?stream_id,
                written,
                elapsed_ms = started.map(|t| t.elapsed().as_millis() as u64),
                "outgoing message complete"
            );
            if read_complete {
                current.complete(None);
            }
        }
    }

    /// Current outgoing stream, or the next list member with unwritten data.
    fn take_outgoing_stream(&self) -> Option<Arc<H1Stream>> {
        if let Some(stream) = self.thread_data.lock().outgoing_stream.clone() {
            return Some(stream);
        }
        let candidates: Vec<Arc<H1Stream>> = {
            let td = self.thread_data.lock();
            td.stream_list.iter().cloned().collect()
        };
        let next = candidates.into_iter().find(|s| !s.is_write_complete())?;
        next.mark_active();
        {
            let mut td = self.thread_data.lock();
            td.outgoing_stream = Some(Arc::clone(&next));
            td.outgoing_stream_timestamp = Some(Instant::now());
            td.encoder.current_stream_id = next.id();
        }
        Some(next)
    }

    fn run_window_update_task(&self) {
        let size = {
            let mut synced = self.synced.lock();
            std::mem::take(&mut synced.window_update_size)
        };
        if size == 0 {
            return;
        }
        if let Some(slot) = self.core.slot() {
            trace!(
                channel = self.core.channel().id(),
                size,
                "applying accumulated window update"
            );
            slot.increment_read_window(size);
        }
    }

    /// Decoder-facing: the incoming message for `stream` is complete.
    pub(crate) fn on_incoming_stream_finished(self: &Arc<Self>, stream: &Arc<H1Stream>) {
        let write_complete = stream.is_write_complete();
        {
            let mut td = self.thread_data.lock();
            if let Some(current) = &td.incoming_stream {
                if Arc::ptr_eq(current, stream) {
                    if let Some(started) = td.incoming_stream_timestamp.take() {
                        trace!(
                            stream = ?stream.id(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "incoming message complete"
                        );
                    }
                    td.incoming_stream = None;
                    td.decoder.current_stream_id = None;
                }
            }
            if write_complete {
                td.stream_list.retain(|s| !Arc::ptr_eq(s, stream));
            }
        }
        if write_complete {
            stream.complete(None);
        }
    }

    /// Decoder-facing: the peer performed a protocol switch. Terminal for
    /// HTTP semantics; subsequent reads pass through unparsed.
    pub fn on_switched_protocols(&self) {
        {
            let mut td = self.thread_data.lock();
            td.has_switched_protocols = true;
            td.can_create_request_handler_stream = false;
        }
        let mut synced = self.synced.lock();
        if synced.new_stream_error.is_none() {
            synced.new_stream_error = Some(HttpError::InvalidState(
                "connection has switched protocols",
            ));
        }
    }

    fn decode_incoming(&self, slot: &Slot, message: Message) -> Result<(), ChannelError> {
        let len = message.data.len();
        let current = {
            let mut td = self.thread_data.lock();
            if td.is_reading_stopped {
                return Err(ChannelError::InvalidState("reading has stopped"));
            }
            td.stats.bytes_read += len as u64;
            td.incoming_stream.clone()
        };

        let stream = match current {
            Some(stream) => stream,
            None => match self.begin_incoming_stream()? {
                Some(stream) => stream,
                None => {
                    trace!(
                        channel = self.core.channel().id(),
                        len,
                        "no stream to receive incoming data, dropping"
                    );
                    return Ok(());
                }
            },
        };
        stream.append_incoming(&message.data);

        if !self.manual_window_management {
            slot.increment_read_window(len);
        }
        Ok(())
    }

    /// Pick (or, on servers, create) the stream that will receive incoming
    /// data.
    fn begin_incoming_stream(&self) -> Result<Option<Arc<H1Stream>>, ChannelError> {
        let stream = match self.core.role() {
            RoleData::Client(_) => {
                let candidates: Vec<Arc<H1Stream>> = {
                    let td = self.thread_data.lock();
                    td.stream_list.iter().cloned().collect()
                };
                candidates.into_iter().find(|s| !s.is_read_complete())
            }
            RoleData::Server(_) => {
                if !self.can_create_request_handler_stream() {
                    return Ok(None);
                }
                let Some(connection) = self.core.connection() else {
                    return Ok(None);
                };
                let Some(on_incoming_request) = connection.server_on_incoming_request() else {
                    return Ok(None);
                };
                // No locks held across the user callback.
                match on_incoming_request(&connection) {
                    Some(stream) => {
                        self.thread_data.lock().stream_list.push_back(Arc::clone(&stream));
                        Some(stream)
                    }
                    None => {
                        warn!(
                            channel = self.core.channel().id(),
                            "on_incoming_request produced no stream, shutting down"
                        );
                        return Err(ChannelError::Application("incoming request rejected"));
                    }
                }
            }
        };

        if let Some(stream) = &stream {
            let mut td = self.thread_data.lock();
            td.incoming_stream = Some(Arc::clone(stream));
            td.incoming_stream_timestamp = Some(Instant::now());
            td.decoder.current_stream_id = stream.id();
        }
        Ok(stream)
    }

    /// Queue a post-upgrade message and forward everything queued so far to
    /// the next handler, verbatim.
    fn pass_midchannel_message(&self, slot: &Slot, message: Message) -> Result<(), ChannelError> {
        let queued: Vec<Message> = {
            let mut td = self.thread_data.lock();
            td.midchannel_read_messages.push_back(message);
            let has_downstream = slot
                .adjacent_right()
                .and_then(|s| s.handler())
                .is_some();
            if !has_downstream {
                // Hold messages until a downstream handler appears.
                return Ok(());
            }
            td.midchannel_read_messages.drain(..).collect()
        };
        for message in queued {
            slot.pass_read_message(message)?;
        }
        Ok(())
    }

    fn handle_channel_shutdown(&self, error: Option<ChannelError>) {
        let streams: Vec<Arc<H1Stream>> = {
            let mut td = self.thread_data.lock();
            td.is_reading_stopped = true;
            td.is_writing_stopped = true;
            td.can_create_request_handler_stream = false;
            td.outgoing_stream = None;
            td.incoming_stream = None;
            td.outgoing_stream_timestamp = None;
            td.incoming_stream_timestamp = None;
            debug!(
                channel = self.core.channel().id(),
                bytes_read = td.stats.bytes_read,
                bytes_written = td.stats.bytes_written,
                streams = td.stream_list.len(),
                decoding_stream = ?td.decoder.current_stream_id,
                "HTTP/1.1 connection shut down"
            );
            td.stream_list.drain(..).collect()
        };
        let pending: Vec<Arc<H1Stream>> = {
            let mut synced = self.synced.lock();
            synced.is_open = false;
            if synced.new_stream_error.is_none() {
                synced.new_stream_error = Some(HttpError::ConnectionClosed);
            }
            synced.new_client_streams.drain(..).collect()
        };

        let stream_error = error
            .map(HttpError::from)
            .unwrap_or(HttpError::ConnectionClosed);
        for stream in streams.into_iter().chain(pending) {
            stream.complete(Some(stream_error.clone()));
        }
    }
}

impl ProtocolConnection for Http1Connection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn close(&self) {
        self.core.channel().shutdown(None);
    }

    fn is_open(&self) -> bool {
        self.synced.lock().is_open
    }

    fn new_requests_allowed(&self) -> bool {
        self.synced.lock().new_stream_error.is_none()
    }

    fn update_window(&self, increment: usize) {
        if increment == 0 {
            trace!("ignoring window update of size 0");
            return;
        }
        if !self.manual_window_management {
            trace!("automatic window management, ignoring manual update");
            return;
        }
        let should_schedule = {
            let mut synced = self.synced.lock();
            if !synced.is_open {
                return;
            }
            let previous = synced.window_update_size;
            synced.window_update_size = previous.saturating_add(increment);
            previous == 0
        };
        if should_schedule {
            let Some(conn) = self.arc_self() else { return };
            self.core.channel().schedule_task("http1-window-update", move || {
                conn.run_window_update_task();
            });
        }
    }

    fn on_handler_installed(&self, slot: &Slot) {
        debug!(
            channel = self.core.channel().id(),
            "HTTP/1.1 handler installed in channel"
        );
        self.core.install_slot(slot.clone());
        self.core.channel().acquire_hold();
        if self.initial_window_size > 0 {
            slot.increment_read_window(self.initial_window_size);
        }
    }

    fn as_channel_handler(self: Arc<Self>) -> HandlerRef {
        self
    }

    fn as_http1(self: Arc<Self>) -> Option<Arc<Http1Connection>> {
        Some(self)
    }
}

impl ChannelHandler for Http1Connection {
    fn name(&self) -> &'static str {
        "http1-connection"
    }

    fn process_read_message(&self, slot: &Slot, message: Message) -> Result<(), ChannelError> {
        let switched = self.thread_data.lock().has_switched_protocols;
        if switched {
            return self.pass_midchannel_message(slot, message);
        }
        self.decode_incoming(slot, message)
    }

    fn process_write_message(&self, slot: &Slot, message: Message) -> Result<(), ChannelError> {
        // Downstream handlers may only write through this connection once
        // it has become a pass-through.
        let switched = self.thread_data.lock().has_switched_protocols;
        if !switched {
            return Err(ChannelError::InvalidState(
                "connection writes its own streams only",
            ));
        }
        slot.send_write_message(message)
    }

    fn on_channel_shutdown(&self, error: Option<ChannelError>) {
        self.handle_channel_shutdown(error);
    }
}

impl std::fmt::Debug for Http1Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http1Connection")
            .field("channel", &self.core.channel().id())
            .field("client", &self.is_client())
            .finish()
    }
}
