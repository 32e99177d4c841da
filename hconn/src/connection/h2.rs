//! HTTP/2 connection implementation.
//!
//! This is the lifecycle half of HTTP/2: settings bookkeeping, PING and
//! GOAWAY records, and the open/closed state machine. Frame encoding and
//! stream multiplexing live in the frame layer, which drives this type
//! through the `handle_*` entry points as frames arrive.
//!
//! Wrong-version dispatch is a type error here: these operations exist only
//! on the concrete HTTP/2 capability. The abstract [`Connection`] handle
//! retains the runtime check.
//!
//! [`Connection`]: super::Connection

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hconn_chan::{Channel, ChannelError, ChannelHandler, HandlerRef, Message, Slot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::HttpError;

use super::{
    ClientData, ConnectionCore, HttpVersion, ProtocolConnection, RoleData, ServerData,
    MAX_STREAM_ID,
};

/// Number of settings defined by the protocol.
pub const HTTP2_SETTINGS_COUNT: usize = 6;

/// PING frames carry exactly eight bytes of opaque data.
pub const HTTP2_PING_DATA_SIZE: usize = 8;

/// A protocol-defined connection setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Http2SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
}

impl Http2SettingId {
    pub const ALL: [Http2SettingId; HTTP2_SETTINGS_COUNT] = [
        Http2SettingId::HeaderTableSize,
        Http2SettingId::EnablePush,
        Http2SettingId::MaxConcurrentStreams,
        Http2SettingId::InitialWindowSize,
        Http2SettingId::MaxFrameSize,
        Http2SettingId::MaxHeaderListSize,
    ];

    fn index(self) -> usize {
        match self {
            Http2SettingId::HeaderTableSize => 0,
            Http2SettingId::EnablePush => 1,
            Http2SettingId::MaxConcurrentStreams => 2,
            Http2SettingId::InitialWindowSize => 3,
            Http2SettingId::MaxFrameSize => 4,
            Http2SettingId::MaxHeaderListSize => 5,
        }
    }
}

/// One setting identifier/value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http2Setting {
    pub id: Http2SettingId,
    pub value: u32,
}

/// Protocol defaults, indexed like [`Http2SettingId::index`].
const DEFAULT_SETTINGS: [u32; HTTP2_SETTINGS_COUNT] =
    [4_096, 1, u32::MAX, 65_535, 16_384, u32::MAX];

/// Options carried by a client connect for the HTTP/2 case.
#[derive(Debug, Clone, Default)]
pub struct Http2ConnectionOptions {
    /// Settings sent in the initial SETTINGS frame, applied over the
    /// protocol defaults.
    pub initial_settings: Vec<Http2Setting>,
}

/// A GOAWAY that was sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Goaway {
    pub http2_error: u32,
    pub last_stream_id: u32,
}

/// Invoked when the peer acknowledges a settings change.
pub type OnSettingsComplete = Box<dyn FnOnce(Option<HttpError>) + Send>;

/// Invoked with the round-trip time when a PING is acknowledged.
pub type OnPingAck = Box<dyn FnOnce(Result<Duration, HttpError>) + Send>;

struct PendingSettings {
    settings: Vec<Http2Setting>,
    on_completed: Option<OnSettingsComplete>,
}

struct PendingPing {
    opaque_data: [u8; HTTP2_PING_DATA_SIZE],
    started: Instant,
    on_ack: Option<OnPingAck>,
}

/// State only the event-loop task may touch.
struct Http2ThreadData {
    /// Most recent stream id initiated by the peer; GOAWAY points here.
    latest_peer_initiated_stream_id: u32,
    is_reading_stopped: bool,
    is_writing_stopped: bool,
}

/// State shared across threads, guarded by one lock. Settings copies and
/// GOAWAY records live here so off-thread getters can read them.
struct Http2SyncedData {
    is_open: bool,
    new_stream_error: Option<HttpError>,
    local_settings: [u32; HTTP2_SETTINGS_COUNT],
    remote_settings: [u32; HTTP2_SETTINGS_COUNT],
    sent_goaway: Option<Goaway>,
    received_goaway: Option<Goaway>,
    pending_settings: VecDeque<PendingSettings>,
    pending_pings: VecDeque<PendingPing>,
    window_update_size: usize,
}

pub struct Http2Connection {
    core: ConnectionCore,
    manual_window_management: bool,
    thread_data: Mutex<Http2ThreadData>,
    synced: Mutex<Http2SyncedData>,
}

impl Http2Connection {
    pub fn new_client(
        channel: Channel,
        manual_window_management: bool,
        options: Option<&Http2ConnectionOptions>,
    ) -> Arc<Http2Connection> {
        Self::new(channel, manual_window_management, options, false)
    }

    pub fn new_server(
        channel: Channel,
        manual_window_management: bool,
        options: Option<&Http2ConnectionOptions>,
    ) -> Arc<Http2Connection> {
        Self::new(channel, manual_window_management, options, true)
    }

    fn new(
        channel: Channel,
        manual_window_management: bool,
        options: Option<&Http2ConnectionOptions>,
        is_server: bool,
    ) -> Arc<Http2Connection> {
        let mut local_settings = DEFAULT_SETTINGS;
        if let Some(options) = options {
            for setting in &options.initial_settings {
                local_settings[setting.id.index()] = setting.value;
            }
        }
        Arc::new_cyclic(|weak: &Weak<Http2Connection>| {
            let self_ref: Weak<dyn ProtocolConnection> = weak.clone();
            let role = if is_server {
                RoleData::Server(ServerData::default())
            } else {
                RoleData::Client(ClientData::default())
            };
            Http2Connection {
                core: ConnectionCore::new(HttpVersion::Http2, channel, role, self_ref),
                manual_window_management,
                thread_data: Mutex::new(Http2ThreadData {
                    latest_peer_initiated_stream_id: 0,
                    is_reading_stopped: false,
                    is_writing_stopped: false,
                }),
                synced: Mutex::new(Http2SyncedData {
                    is_open: true,
                    new_stream_error: None,
                    local_settings,
                    remote_settings: DEFAULT_SETTINGS,
                    sent_goaway: None,
                    received_goaway: None,
                    pending_settings: VecDeque::new(),
                    pending_pings: VecDeque::new(),
                    window_update_size: 0,
                }),
            }
        })
    }

    fn arc_self(&self) -> Option<Arc<Http2Connection>> {
        self.core
            .connection()
            .and_then(|conn| conn.proto.as_http2_arc())
    }

    /// Queue a settings change. The settings take effect and `on_completed`
    /// fires when the peer's acknowledgement arrives through
    /// [`Http2Connection::handle_settings_ack`].
    pub fn change_settings(
        &self,
        settings: &[Http2Setting],
        on_completed: Option<OnSettingsComplete>,
    ) -> Result<(), HttpError> {
        for setting in settings {
            validate_setting(setting)?;
        }
        {
            let mut synced = self.synced.lock();
            if !synced.is_open {
                return Err(HttpError::ConnectionClosed);
            }
            synced.pending_settings.push_back(PendingSettings {
                settings: settings.to_vec(),
                on_completed,
            });
        }
        trace!(
            channel = self.core.channel().id(),
            count = settings.len(),
            "settings change queued"
        );
        self.schedule_frame_submission("http2-send-settings");
        Ok(())
    }

    /// Queue a PING. `on_ack` fires with the round-trip time when the
    /// acknowledgement arrives through [`Http2Connection::handle_ping_ack`].
    pub fn ping(
        &self,
        opaque_data: Option<&[u8]>,
        on_ack: Option<OnPingAck>,
    ) -> Result<(), HttpError> {
        let mut data = [0u8; HTTP2_PING_DATA_SIZE];
        if let Some(opaque) = opaque_data {
            if opaque.len() != HTTP2_PING_DATA_SIZE {
                return Err(HttpError::InvalidArgument(
                    "ping data must be exactly 8 bytes",
                ));
            }
            data.copy_from_slice(opaque);
        }
        {
            let mut synced = self.synced.lock();
            if !synced.is_open {
                return Err(HttpError::ConnectionClosed);
            }
            synced.pending_pings.push_back(PendingPing {
                opaque_data: data,
                started: Instant::now(),
                on_ack,
            });
        }
        self.schedule_frame_submission("http2-send-ping");
        Ok(())
    }

    /// Record and submit a GOAWAY. With `allow_more_streams` the peer may
    /// still open streams up to the maximum id; otherwise the last peer
    /// stream actually seen is reported.
    pub fn send_goaway(
        &self,
        http2_error: u32,
        allow_more_streams: bool,
        debug_data: Option<Bytes>,
    ) -> Result<(), HttpError> {
        if !self.synced.lock().is_open {
            return Err(HttpError::ConnectionClosed);
        }
        let Some(conn) = self.arc_self() else {
            return Err(HttpError::ConnectionClosed);
        };
        let debug_len = debug_data.as_ref().map_or(0, Bytes::len);
        self.core.channel().schedule_task("http2-send-goaway", move || {
            let last_stream_id = if allow_more_streams {
                MAX_STREAM_ID
            } else {
                conn.thread_data.lock().latest_peer_initiated_stream_id
            };
            let goaway = Goaway {
                http2_error,
                last_stream_id,
            };
            conn.synced.lock().sent_goaway = Some(goaway);
            info!(
                channel = conn.core.channel().id(),
                http2_error,
                last_stream_id,
                debug_len,
                "GOAWAY submitted to frame layer"
            );
        });
        Ok(())
    }

    /// Most recent GOAWAY this side sent, or `InvalidState` if none yet.
    pub fn sent_goaway(&self) -> Result<Goaway, HttpError> {
        self.synced
            .lock()
            .sent_goaway
            .ok_or(HttpError::InvalidState("no goaway has been sent"))
    }

    /// Most recent GOAWAY the peer sent, or `InvalidState` if none yet.
    pub fn received_goaway(&self) -> Result<Goaway, HttpError> {
        self.synced
            .lock()
            .received_goaway
            .ok_or(HttpError::InvalidState("no goaway has been received"))
    }

    pub fn local_settings(&self) -> Vec<Http2Setting> {
        let synced = self.synced.lock();
        settings_vec(&synced.local_settings)
    }

    pub fn remote_settings(&self) -> Vec<Http2Setting> {
        let synced = self.synced.lock();
        settings_vec(&synced.remote_settings)
    }

    /// Frame-layer entry: the peer acknowledged the oldest pending settings
    /// change. Applies it locally and fires its completion callback.
    pub fn handle_settings_ack(&self) {
        let pending = {
            let mut synced = self.synced.lock();
            let Some(pending) = synced.pending_settings.pop_front() else {
                warn!(
                    channel = self.core.channel().id(),
                    "settings acknowledgement with nothing pending"
                );
                return;
            };
            for setting in &pending.settings {
                synced.local_settings[setting.id.index()] = setting.value;
            }
            pending
        };
        if let Some(on_completed) = pending.on_completed {
            on_completed(None);
        }
    }

    /// Frame-layer entry: a PING acknowledgement arrived.
    pub fn handle_ping_ack(&self, opaque_data: &[u8]) {
        let pending = {
            let mut synced = self.synced.lock();
            synced.pending_pings.pop_front()
        };
        let Some(pending) = pending else {
            warn!(
                channel = self.core.channel().id(),
                "ping acknowledgement with nothing pending"
            );
            return;
        };
        if pending.opaque_data != opaque_data {
            warn!(
                channel = self.core.channel().id(),
                "ping acknowledgement carries mismatched opaque data"
            );
        }
        if let Some(on_ack) = pending.on_ack {
            on_ack(Ok(pending.started.elapsed()));
        }
    }

    /// Frame-layer entry: the peer sent a GOAWAY. New streams are rejected
    /// from this point on.
    pub fn handle_peer_goaway(&self, goaway: Goaway) {
        let mut synced = self.synced.lock();
        synced.received_goaway = Some(goaway);
        if synced.new_stream_error.is_none() {
            synced.new_stream_error = Some(HttpError::ConnectionClosed);
        }
    }

    /// Frame-layer entry: the peer's settings, as last acknowledged.
    pub fn handle_remote_settings(&self, settings: &[Http2Setting]) {
        let mut synced = self.synced.lock();
        for setting in settings {
            synced.remote_settings[setting.id.index()] = setting.value;
        }
    }

    /// Frame-layer entry: a peer-initiated stream was observed.
    pub fn handle_peer_stream_started(&self, stream_id: u32) {
        let mut td = self.thread_data.lock();
        if stream_id > td.latest_peer_initiated_stream_id {
            td.latest_peer_initiated_stream_id = stream_id;
        }
    }

    fn schedule_frame_submission(&self, name: &'static str) {
        let Some(conn) = self.arc_self() else { return };
        self.core.channel().schedule_task(name, move || {
            if conn.thread_data.lock().is_writing_stopped {
                return;
            }
            // Encoding is the frame layer's concern; this task exists so
            // submissions observe the same ordering as stream writes.
            trace!(channel = conn.core.channel().id(), task = name, "frame submission ordered");
        });
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
                "applying accumulated connection window update"
            );
            slot.increment_read_window(size);
        }
    }

    fn handle_channel_shutdown(&self, error: Option<ChannelError>) {
        {
            let mut td = self.thread_data.lock();
            td.is_reading_stopped = true;
            td.is_writing_stopped = true;
        }
        let (settings_callbacks, ping_callbacks) = {
            let mut synced = self.synced.lock();
            synced.is_open = false;
            if synced.new_stream_error.is_none() {
                synced.new_stream_error = Some(HttpError::ConnectionClosed);
            }
            let settings: Vec<OnSettingsComplete> = synced
                .pending_settings
                .drain(..)
                .filter_map(|p| p.on_completed)
                .collect();
            let pings: Vec<OnPingAck> = synced
                .pending_pings
                .drain(..)
                .filter_map(|p| p.on_ack)
                .collect();
            (settings, pings)
        };
        let error = error
            .map(HttpError::from)
            .unwrap_or(HttpError::ConnectionClosed);
        for on_completed in settings_callbacks {
            on_completed(Some(error.clone()));
        }
        for on_ack in ping_callbacks {
            on_ack(Err(error.clone()));
        }
        debug!(
            channel = self.core.channel().id(),
            "HTTP/2 connection shut down"
        );
    }
}

fn validate_setting(setting: &Http2Setting) -> Result<(), HttpError> {
    match setting.id {
        Http2SettingId::EnablePush if setting.value > 1 => {
            Err(HttpError::InvalidArgument("enable_push must be 0 or 1"))
        }
        Http2SettingId::InitialWindowSize if setting.value > MAX_STREAM_ID => Err(
            HttpError::InvalidArgument("initial window size exceeds 2^31-1"),
        ),
        Http2SettingId::MaxFrameSize
            if !(16_384..=16_777_215).contains(&setting.value) =>
        {
            Err(HttpError::InvalidArgument(
                "max frame size outside the legal range",
            ))
        }
        _ => Ok(()),
    }
}

fn settings_vec(values: &[u32; HTTP2_SETTINGS_COUNT]) -> Vec<Http2Setting> {
    Http2SettingId::ALL
        .iter()
        .map(|id| Http2Setting {
            id: *id,
            value: values[id.index()],
        })
        .collect()
}

impl ProtocolConnection for Http2Connection {
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
            self.core.channel().schedule_task("http2-window-update", move || {
                conn.run_window_update_task();
            });
        }
    }

    fn on_handler_installed(&self, slot: &Slot) {
        debug!(
            channel = self.core.channel().id(),
            "HTTP/2 handler installed in channel"
        );
        self.core.install_slot(slot.clone());
        self.core.channel().acquire_hold();
    }

    fn as_channel_handler(self: Arc<Self>) -> HandlerRef {
        self
    }

    fn as_http2(&self) -> Option<&Http2Connection> {
        Some(self)
    }

    fn as_http2_arc(self: Arc<Self>) -> Option<Arc<Http2Connection>> {
        Some(self)
    }
}

impl ChannelHandler for Http2Connection {
    fn name(&self) -> &'static str {
        "http2-connection"
    }

    fn process_read_message(&self, _slot: &Slot, message: Message) -> Result<(), ChannelError> {
        if self.thread_data.lock().is_reading_stopped {
            return Err(ChannelError::InvalidState("reading has stopped"));
        }
        // Frame parsing belongs to the frame layer.
        trace!(
            channel = self.core.channel().id(),
            len = message.data.len(),
            "frame bytes handed to frame layer"
        );
        Ok(())
    }

    fn on_channel_shutdown(&self, error: Option<ChannelError>) {
        self.handle_channel_shutdown(error);
    }
}

impl std::fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Connection")
            .field("channel", &self.core.channel().id())
            .finish()
    }
}
