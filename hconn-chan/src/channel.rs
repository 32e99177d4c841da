//! Channels, slots and handlers.
//!
//! A channel is an ordered chain of slots, each holding a handler, and
//! represents one bidirectional byte stream with layered processing. Every
//! channel owns exactly one event-loop task; all handler execution and all
//! mutation of handler-internal per-loop state is serialized onto that task
//! through [`Channel::schedule_task`].
//!
//! Lifetime is governed by a hold count rather than by `Arc` strong counts:
//! the creator holds one hold (returned when shutdown completes) and upper
//! layers take additional holds while they reference the channel. When the
//! hold count reaches zero the slots are destroyed, dropping their handlers,
//! and the event loop stops.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::trace;

use crate::bootstrap::Bootstrap;
use crate::error::ChannelError;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// How often the statistics task samples channel byte counters.
const STATS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One message flowing through a channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub data: Bytes,
}

impl Message {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

/// A participant installed in a channel slot.
///
/// Read messages flow from the socket end toward the application end; write
/// messages flow the opposite way. Handlers that do not accept a direction
/// keep the default rejection.
pub trait ChannelHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bytes flowing toward the application end of the channel.
    fn process_read_message(&self, slot: &Slot, message: Message) -> Result<(), ChannelError>;

    /// Bytes flowing toward the socket end of the channel.
    fn process_write_message(&self, _slot: &Slot, _message: Message) -> Result<(), ChannelError> {
        Err(ChannelError::InvalidState("handler does not accept writes"))
    }

    /// The channel is shutting down; stop all reading and writing.
    ///
    /// Always invoked on the channel's event-loop task, exactly once.
    fn on_channel_shutdown(&self, error: Option<ChannelError>);

    /// Negotiated application protocol, for TLS handlers.
    fn alpn_protocol(&self) -> Option<Bytes> {
        None
    }
}

pub type HandlerRef = Arc<dyn ChannelHandler>;

/// Shutdown callback registered by the bootstrap that created the channel.
pub type OnChannelShutdown = Box<dyn FnOnce(&Channel, Option<ChannelError>) + Send>;

/// A point-in-time sample of channel activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStatsSample {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Consumer of periodic [`ChannelStatsSample`]s, e.g. a throughput monitor.
pub trait StatisticsHandler: Send + Sync {
    fn report(&self, channel: &Channel, sample: ChannelStatsSample);
}

enum ChannelTask {
    Run {
        name: &'static str,
        run: Box<dyn FnOnce() + Send>,
    },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    Running,
    ShuttingDown,
    Complete,
}

struct SlotEntry {
    id: u32,
    handler: Option<HandlerRef>,
}

struct ChannelState {
    slots: Vec<SlotEntry>,
    next_slot_id: u32,
    phase: ShutdownPhase,
    on_shutdown: Option<OnChannelShutdown>,
    stats: Option<Arc<dyn StatisticsHandler>>,
}

pub(crate) struct ChannelInner {
    id: u64,
    host_address: Option<String>,
    bootstrap: Bootstrap,
    tasks: mpsc::UnboundedSender<ChannelTask>,
    holds: AtomicUsize,
    state: Mutex<ChannelState>,
    shutdown_signal: broadcast::Sender<()>,
    backpressure: bool,
    read_window: AtomicUsize,
    window_notify: Notify,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Options for [`Channel::new`].
pub struct ChannelOptions {
    pub bootstrap: Bootstrap,
    /// Remote host this channel is connected to, if any.
    pub host_address: Option<String>,
    /// Invoked once, on the event-loop task, when shutdown completes.
    pub on_shutdown: Option<OnChannelShutdown>,
    /// When set, socket reads are gated on the read window granted through
    /// [`Slot::increment_read_window`].
    pub enable_read_back_pressure: bool,
}

/// Handle to a channel. Cloning the handle does not take a hold.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a bare channel with no slots and spawn its event loop.
    ///
    /// The creator owns one hold, returned automatically when shutdown
    /// completes.
    pub fn new(options: ChannelOptions) -> Channel {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (shutdown_signal, _) = broadcast::channel(1);

        let inner = Arc::new(ChannelInner {
            id,
            host_address: options.host_address,
            bootstrap: options.bootstrap.clone(),
            tasks: task_tx,
            holds: AtomicUsize::new(1),
            state: Mutex::new(ChannelState {
                slots: Vec::new(),
                next_slot_id: 0,
                phase: ShutdownPhase::Running,
                on_shutdown: options.on_shutdown,
                stats: None,
            }),
            shutdown_signal,
            backpressure: options.enable_read_back_pressure,
            read_window: AtomicUsize::new(0),
            window_notify: Notify::new(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        });

        options.bootstrap.spawn(run_event_loop(task_rx, id));
        trace!(channel = id, "channel created");
        Channel { inner }
    }

    /// Unique identifier, stable for the channel's lifetime. Suitable as a
    /// map key for tracking live channels.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Address of the remote host, when the channel was built from a socket.
    pub fn host_address(&self) -> Option<&str> {
        self.inner.host_address.as_deref()
    }

    pub(crate) fn bootstrap(&self) -> &Bootstrap {
        &self.inner.bootstrap
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown_signal.subscribe()
    }

    /// Append a new slot to the tail of the slot chain.
    pub fn append_slot(&self) -> Result<Slot, ChannelError> {
        let mut state = self.inner.state.lock();
        if state.phase != ShutdownPhase::Running {
            return Err(ChannelError::ShuttingDown);
        }
        let id = state.next_slot_id;
        state.next_slot_id += 1;
        state.slots.push(SlotEntry { id, handler: None });
        Ok(Slot {
            channel: self.clone(),
            id,
        })
    }

    /// Schedule a closure onto the channel's event-loop task.
    ///
    /// Tasks run in submission order. After the channel is finalized the
    /// closure is silently dropped.
    pub fn schedule_task(&self, name: &'static str, run: impl FnOnce() + Send + 'static) {
        let task = ChannelTask::Run {
            name,
            run: Box::new(run),
        };
        if self.inner.tasks.send(task).is_err() {
            trace!(
                channel = self.inner.id,
                task = name,
                "task dropped, event loop already stopped"
            );
        }
    }

    /// Begin channel shutdown. Idempotent; later calls are ignored.
    ///
    /// Shutdown runs on the event-loop task: every handler's
    /// [`ChannelHandler::on_channel_shutdown`] fires (application end first),
    /// then the bootstrap shutdown callback, then the creator hold is
    /// returned.
    pub fn shutdown(&self, error: Option<ChannelError>) {
        {
            let mut state = self.inner.state.lock();
            if state.phase != ShutdownPhase::Running {
                trace!(channel = self.inner.id, "shutdown already requested");
                return;
            }
            state.phase = ShutdownPhase::ShuttingDown;
        }
        trace!(channel = self.inner.id, error = ?error, "channel shutdown requested");
        let _ = self.inner.shutdown_signal.send(());
        let channel = self.clone();
        self.schedule_task("channel-shutdown", move || channel.run_shutdown(error));
    }

    fn run_shutdown(&self, error: Option<ChannelError>) {
        let (handlers, callback) = {
            let mut state = self.inner.state.lock();
            state.phase = ShutdownPhase::Complete;
            let handlers: Vec<HandlerRef> = state
                .slots
                .iter()
                .filter_map(|slot| slot.handler.clone())
                .collect();
            (handlers, state.on_shutdown.take())
        };

        for handler in handlers.iter().rev() {
            handler.on_channel_shutdown(error.clone());
        }
        if let Some(callback) = callback {
            callback(self, error);
        }

        // Creator hold, taken in new().
        self.release_hold();
    }

    /// Take an additional hold on the channel.
    pub fn acquire_hold(&self) {
        self.inner.holds.fetch_add(1, Ordering::AcqRel);
    }

    /// Return a hold. The final hold destroys the slots and stops the loop.
    pub fn release_hold(&self) {
        let prev = self.inner.holds.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "channel hold count underflow");
        if prev == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        trace!(channel = self.inner.id, "finalizing channel");
        let slots = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.slots)
        };
        drop(slots);
        let _ = self.inner.tasks.send(ChannelTask::Stop);
    }

    /// Whether shutdown has been requested or completed.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().phase != ShutdownPhase::Running
    }

    /// Attach a statistics handler and start periodic sampling.
    pub fn set_statistics_handler(&self, handler: Arc<dyn StatisticsHandler>) {
        self.inner.state.lock().stats = Some(handler);
        let channel = self.clone();
        let mut shutdown_rx = self.subscribe_shutdown();
        self.inner.bootstrap.spawn(async move {
            let mut ticker = tokio::time::interval(STATS_SAMPLE_INTERVAL);
            ticker.tick().await; // first tick completes immediately
            let mut last = ChannelStatsSample::default();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let read = channel.inner.bytes_read.load(Ordering::Relaxed);
                        let written = channel.inner.bytes_written.load(Ordering::Relaxed);
                        let sample = ChannelStatsSample {
                            bytes_read: read - last.bytes_read,
                            bytes_written: written - last.bytes_written,
                        };
                        last = ChannelStatsSample { bytes_read: read, bytes_written: written };
                        let handler = channel.inner.state.lock().stats.clone();
                        if let Some(handler) = handler {
                            handler.report(&channel, sample);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Grow the inbound read window. A no-op unless the channel was created
    /// with read back-pressure enabled.
    pub fn increment_read_window(&self, size: usize) {
        if !self.inner.backpressure || size == 0 {
            return;
        }
        self.inner.read_window.fetch_add(size, Ordering::AcqRel);
        self.inner.window_notify.notify_one();
    }

    pub(crate) async fn wait_for_read_window(&self) {
        if !self.inner.backpressure {
            return;
        }
        loop {
            if self.inner.read_window.load(Ordering::Acquire) > 0 {
                return;
            }
            self.inner.window_notify.notified().await;
        }
    }

    pub(crate) fn debit_read_window(&self, amount: usize) {
        if !self.inner.backpressure {
            return;
        }
        let mut current = self.inner.read_window.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(amount);
            match self.inner.read_window.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.inner.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.inner.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    fn slot_index(state: &ChannelState, id: u32) -> Option<usize> {
        state.slots.iter().position(|slot| slot.id == id)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("holds", &self.inner.holds.load(Ordering::Relaxed))
            .finish()
    }
}

/// A position in a channel's slot chain.
#[derive(Clone)]
pub struct Slot {
    channel: Channel,
    id: u32,
}

impl Slot {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Bind a handler to this slot.
    pub fn set_handler(&self, handler: HandlerRef) -> Result<(), ChannelError> {
        let mut state = self.channel.inner.state.lock();
        match Channel::slot_index(&state, self.id) {
            Some(index) => {
                state.slots[index].handler = Some(handler);
                Ok(())
            }
            None => Err(ChannelError::SlotRemoved),
        }
    }

    pub fn handler(&self) -> Option<HandlerRef> {
        let state = self.channel.inner.state.lock();
        Channel::slot_index(&state, self.id).and_then(|index| state.slots[index].handler.clone())
    }

    /// Remove this slot (and its handler, if any) from the chain.
    pub fn remove(&self) {
        let handler = {
            let mut state = self.channel.inner.state.lock();
            match Channel::slot_index(&state, self.id) {
                Some(index) => state.slots.remove(index).handler,
                None => None,
            }
        };
        drop(handler);
    }

    /// The neighboring slot on the inbound (socket) side.
    pub fn adjacent_left(&self) -> Option<Slot> {
        let state = self.channel.inner.state.lock();
        let index = Channel::slot_index(&state, self.id)?;
        if index == 0 {
            return None;
        }
        Some(Slot {
            channel: self.channel.clone(),
            id: state.slots[index - 1].id,
        })
    }

    /// The neighboring slot on the outbound (application) side.
    pub fn adjacent_right(&self) -> Option<Slot> {
        let state = self.channel.inner.state.lock();
        let index = Channel::slot_index(&state, self.id)?;
        let entry = state.slots.get(index + 1)?;
        Some(Slot {
            channel: self.channel.clone(),
            id: entry.id,
        })
    }

    /// Send a message toward the socket end, delivered to the nearest
    /// inbound-side handler that accepts writes.
    pub fn send_write_message(&self, message: Message) -> Result<(), ChannelError> {
        let mut cursor = self.adjacent_left();
        while let Some(slot) = cursor {
            if let Some(handler) = slot.handler() {
                return handler.process_write_message(&slot, message);
            }
            cursor = slot.adjacent_left();
        }
        Err(ChannelError::InvalidState(
            "no write-capable handler on the inbound side",
        ))
    }

    /// Pass a read message to the next handler on the application side.
    pub fn pass_read_message(&self, message: Message) -> Result<(), ChannelError> {
        let next = self
            .adjacent_right()
            .and_then(|slot| slot.handler().map(|handler| (slot, handler)));
        match next {
            Some((slot, handler)) => handler.process_read_message(&slot, message),
            None => Err(ChannelError::InvalidState(
                "no downstream handler for read message",
            )),
        }
    }

    pub fn increment_read_window(&self, size: usize) {
        self.channel.increment_read_window(size);
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("channel", &self.channel.id())
            .field("id", &self.id)
            .finish()
    }
}

async fn run_event_loop(mut tasks: mpsc::UnboundedReceiver<ChannelTask>, id: u64) {
    trace!(channel = id, "event loop started");
    while let Some(task) = tasks.recv().await {
        match task {
            ChannelTask::Run { name, run } => {
                trace!(channel = id, task = name, "running channel task");
                run();
            }
            ChannelTask::Stop => break,
        }
    }
    trace!(channel = id, "event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    struct NullHandler;

    impl ChannelHandler for NullHandler {
        fn name(&self) -> &'static str {
            "null"
        }
        fn process_read_message(&self, _slot: &Slot, _message: Message) -> Result<(), ChannelError> {
            Ok(())
        }
        fn on_channel_shutdown(&self, _error: Option<ChannelError>) {}
    }

    fn test_channel(on_shutdown: Option<OnChannelShutdown>) -> Channel {
        Channel::new(ChannelOptions {
            bootstrap: Bootstrap::current().unwrap(),
            host_address: None,
            on_shutdown,
            enable_read_back_pressure: false,
        })
    }

    #[tokio::test]
    async fn slot_adjacency_follows_chain_order() {
        let channel = test_channel(None);
        let a = channel.append_slot().unwrap();
        let b = channel.append_slot().unwrap();
        let c = channel.append_slot().unwrap();

        assert!(a.adjacent_left().is_none());
        assert_eq!(a.adjacent_right().unwrap().id, b.id);
        assert_eq!(b.adjacent_left().unwrap().id, a.id);
        assert_eq!(c.adjacent_left().unwrap().id, b.id);
        assert!(c.adjacent_right().is_none());

        b.remove();
        assert_eq!(c.adjacent_left().unwrap().id, a.id);
        channel.shutdown(None);
    }

    #[tokio::test]
    async fn removed_slot_rejects_handler() {
        let channel = test_channel(None);
        let slot = channel.append_slot().unwrap();
        slot.remove();
        assert_eq!(
            slot.set_handler(Arc::new(NullHandler)).unwrap_err(),
            ChannelError::SlotRemoved
        );
        channel.shutdown(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_callback_fires_exactly_once() {
        let (tx, rx) = bounded(4);
        let channel = test_channel(Some(Box::new(move |_channel, error| {
            tx.send(error).unwrap();
        })));

        channel.shutdown(Some(ChannelError::Closed));
        channel.shutdown(None); // ignored

        let delivered = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivered, Some(ChannelError::Closed));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn slots_survive_until_last_hold_released() {
        let channel = test_channel(None);
        let slot = channel.append_slot().unwrap();
        slot.set_handler(Arc::new(NullHandler)).unwrap();

        channel.acquire_hold();
        channel.shutdown(None);

        // Shutdown returned the creator hold; ours still keeps slots alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slot.handler().is_some());

        channel.release_hold();
        assert!(slot.handler().is_none());
    }
}
