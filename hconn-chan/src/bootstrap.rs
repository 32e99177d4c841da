//! Client and server socket bootstrap.
//!
//! The bootstrap turns sockets into channels. An outbound connect produces
//! one channel and reports it through a setup callback; a listener produces
//! one channel per accepted socket and reports each through an incoming
//! callback. In both cases the channel's slot 0 holds the socket handler:
//! writes funnel into it and drain to the socket, reads are pumped off the
//! socket and dispatched rightward on the channel's event-loop task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::channel::{
    Channel, ChannelHandler, ChannelOptions, Message, OnChannelShutdown, Slot,
};
use crate::error::ChannelError;
use crate::socket::{bind_tcp_listener, configure_stream, SocketOptions, TlsConnectionOptions};

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// Executor handle that channels and socket pumps are spawned onto.
#[derive(Clone)]
pub struct Bootstrap {
    handle: tokio::runtime::Handle,
}

impl Bootstrap {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Bootstrap bound to the calling task's runtime.
    pub fn current() -> Result<Self, ChannelError> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|_| ChannelError::InvalidState("no tokio runtime on this thread"))
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Bootstrap")
    }
}

/// Setup callback for an outbound channel. Fires exactly once per connect
/// attempt: with the channel on success, with the error otherwise. On error
/// no channel exists and no shutdown callback will follow.
pub type OnChannelSetup = Box<dyn FnOnce(Result<Channel, ChannelError>) + Send>;

/// Per-child callback invoked as each accepted channel finishes shutdown.
pub type OnChildChannelShutdown = Arc<dyn Fn(&Channel, Option<ChannelError>) + Send + Sync>;

/// Callback invoked for each accepted (or failed) incoming socket.
pub type OnIncomingChannel = Arc<dyn Fn(Result<Channel, ChannelError>) + Send + Sync>;

/// Invoked once the listener and every channel it accepted are gone.
pub type OnListenerDestroy = Box<dyn FnOnce() + Send>;

/// Options for [`new_socket_channel`].
pub struct SocketChannelOptions {
    pub bootstrap: Bootstrap,
    pub host_name: String,
    pub port: u16,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub enable_read_back_pressure: bool,
    pub setup: OnChannelSetup,
    pub shutdown: Option<OnChannelShutdown>,
}

/// Start one outbound socket channel.
///
/// Returns synchronously once the connect attempt is in flight; the result
/// is delivered through `options.setup`. Connect failures therefore arrive
/// via the callback, not the return value.
pub fn new_socket_channel(options: SocketChannelOptions) -> Result<(), ChannelError> {
    if options.host_name.is_empty() {
        return Err(ChannelError::InvalidState("empty host name"));
    }
    if options.tls_options.is_some() {
        // The default socket factory has no TLS handler to install; a
        // TLS-capable factory must be swapped in above this layer.
        return Err(ChannelError::InvalidState(
            "default socket factory does not provide a tls handler",
        ));
    }

    let bootstrap = options.bootstrap.clone();
    bootstrap.clone().spawn(async move {
        let SocketChannelOptions {
            bootstrap,
            host_name,
            port,
            socket_options,
            tls_options: _,
            enable_read_back_pressure,
            setup,
            shutdown,
        } = options;

        let connect = TcpStream::connect((host_name.as_str(), port));
        let stream = match tokio::time::timeout(socket_options.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(host = %host_name, port, error = %err, "socket connect failed");
                setup(Err(err.into()));
                return;
            }
            Err(_) => {
                debug!(host = %host_name, port, "socket connect timed out");
                setup(Err(ChannelError::Socket {
                    kind: std::io::ErrorKind::TimedOut,
                    message: format!("connecting to {host_name}:{port}"),
                }));
                return;
            }
        };

        if let Err(err) = configure_stream(&stream, &socket_options) {
            warn!(error = %err, "failed to configure socket, continuing with defaults");
        }

        let channel = channel_from_stream(
            stream,
            ChannelOptions {
                bootstrap,
                host_address: Some(format!("{host_name}:{port}")),
                on_shutdown: shutdown,
                enable_read_back_pressure,
            },
        );
        match channel {
            Ok(channel) => {
                trace!(channel = channel.id(), host = %host_name, port, "socket channel established");
                setup(Ok(channel));
            }
            Err(err) => setup(Err(err)),
        }
    });

    Ok(())
}

/// Options for [`new_socket_listener`].
pub struct ServerListenerOptions {
    pub bootstrap: Bootstrap,
    pub host_name: String,
    pub port: u16,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub enable_read_back_pressure: bool,
    pub incoming: OnIncomingChannel,
    pub shutdown: OnChildChannelShutdown,
    pub destroy: OnListenerDestroy,
}

struct ListenerState {
    accepting: bool,
    destroying: bool,
    children: HashMap<u64, Channel>,
    destroy: Option<OnListenerDestroy>,
}

struct ListenerInner {
    local_addr: SocketAddr,
    stop: broadcast::Sender<()>,
    state: Mutex<ListenerState>,
}

/// Handle to a listening socket. Destroyed through
/// [`destroy_socket_listener`]; dropping the handle alone does not stop it.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}

/// Bind a listening socket and start accepting channels.
///
/// Bind errors are reported synchronously. Each accepted socket becomes a
/// channel announced through `options.incoming`; accept failures are
/// announced the same way and accepting continues.
pub fn new_socket_listener(options: ServerListenerOptions) -> Result<Listener, ChannelError> {
    if options.tls_options.is_some() {
        return Err(ChannelError::InvalidState(
            "default socket factory does not provide a tls handler",
        ));
    }

    let addr: SocketAddr = format!("{}:{}", options.host_name, options.port)
        .parse()
        .map_err(|_| ChannelError::InvalidState("endpoint is not a valid socket address"))?;
    let listener = bind_tcp_listener(addr)?;
    let local_addr = listener.local_addr()?;

    let (stop, stop_rx) = broadcast::channel(1);
    let inner = Arc::new(ListenerInner {
        local_addr,
        stop,
        state: Mutex::new(ListenerState {
            accepting: true,
            destroying: false,
            children: HashMap::new(),
            destroy: Some(options.destroy),
        }),
    });

    info!(addr = %local_addr, "listener bound, accepting connections");
    options.bootstrap.clone().spawn(run_accept_loop(
        listener,
        Arc::clone(&inner),
        options.bootstrap,
        options.socket_options,
        options.enable_read_back_pressure,
        options.incoming,
        options.shutdown,
        stop_rx,
    ));

    Ok(Listener { inner })
}

/// Stop accepting, shut down any remaining child channels, and fire the
/// destroy callback once the last child has finished shutting down.
pub fn destroy_socket_listener(listener: Listener) {
    let children: Vec<Channel> = {
        let mut state = listener.inner.state.lock();
        state.destroying = true;
        state.children.values().cloned().collect()
    };
    info!(addr = %listener.inner.local_addr, children = children.len(), "destroying listener");
    let _ = listener.inner.stop.send(());
    for channel in children {
        channel.shutdown(Some(ChannelError::Closed));
    }
    maybe_fire_destroy(&listener.inner);
}

fn maybe_fire_destroy(inner: &Arc<ListenerInner>) {
    let destroy = {
        let mut state = inner.state.lock();
        if state.destroying && !state.accepting && state.children.is_empty() {
            state.destroy.take()
        } else {
            None
        }
    };
    if let Some(destroy) = destroy {
        trace!(addr = %inner.local_addr, "listener destroy complete");
        destroy();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_accept_loop(
    listener: tokio::net::TcpListener,
    inner: Arc<ListenerInner>,
    bootstrap: Bootstrap,
    socket_options: SocketOptions,
    enable_read_back_pressure: bool,
    incoming: OnIncomingChannel,
    shutdown: OnChildChannelShutdown,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = configure_stream(&stream, &socket_options) {
                            warn!(peer = %peer, error = %err, "failed to configure accepted socket");
                        }
                        let child_shutdown = child_shutdown_callback(&inner, &shutdown);
                        let channel = channel_from_stream(
                            stream,
                            ChannelOptions {
                                bootstrap: bootstrap.clone(),
                                host_address: Some(peer.to_string()),
                                on_shutdown: Some(child_shutdown),
                                enable_read_back_pressure,
                            },
                        );
                        match channel {
                            Ok(channel) => {
                                let destroying = {
                                    let mut state = inner.state.lock();
                                    state.children.insert(channel.id(), channel.clone());
                                    state.destroying
                                };
                                trace!(channel = channel.id(), peer = %peer, "incoming channel accepted");
                                incoming(Ok(channel.clone()));
                                if destroying {
                                    // Raced destroy_socket_listener's fan-out;
                                    // shut the straggler down ourselves so the
                                    // destroy callback cannot be held up.
                                    channel.shutdown(Some(ChannelError::Closed));
                                }
                            }
                            Err(err) => incoming(Err(err)),
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        incoming(Err(err.into()));
                    }
                }
            }
            _ = stop_rx.recv() => break,
        }
    }
    inner.state.lock().accepting = false;
    maybe_fire_destroy(&inner);
}

fn child_shutdown_callback(
    inner: &Arc<ListenerInner>,
    shutdown: &OnChildChannelShutdown,
) -> OnChannelShutdown {
    let inner = Arc::clone(inner);
    let shutdown = Arc::clone(shutdown);
    Box::new(move |channel, error| {
        // User callback first: the destroy callback must fire strictly after
        // every child's shutdown callback has returned.
        shutdown(channel, error);
        inner.state.lock().children.remove(&channel.id());
        maybe_fire_destroy(&inner);
    })
}

/// Wrap a connected stream in a channel whose slot 0 is the socket handler.
pub fn channel_from_stream(
    stream: TcpStream,
    options: ChannelOptions,
) -> Result<Channel, ChannelError> {
    let channel = Channel::new(options);
    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel();

    let slot = channel.append_slot()?;
    slot.set_handler(Arc::new(SocketHandler { write_tx }))?;

    channel.bootstrap().spawn(run_read_loop(
        channel.clone(),
        slot.clone(),
        read_half,
        channel.subscribe_shutdown(),
    ));
    channel.bootstrap().spawn(run_write_loop(
        channel.clone(),
        write_rx,
        write_half,
        channel.subscribe_shutdown(),
    ));
    Ok(channel)
}

/// Slot-0 handler owning the socket's write direction.
struct SocketHandler {
    write_tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelHandler for SocketHandler {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn process_read_message(&self, _slot: &Slot, _message: Message) -> Result<(), ChannelError> {
        Err(ChannelError::InvalidState(
            "socket handler is the channel origin",
        ))
    }

    fn process_write_message(&self, _slot: &Slot, message: Message) -> Result<(), ChannelError> {
        self.write_tx
            .send(message.data)
            .map_err(|_| ChannelError::Closed)
    }

    fn on_channel_shutdown(&self, _error: Option<ChannelError>) {
        // The read and write pumps exit on the shutdown broadcast.
    }
}

async fn run_read_loop(
    channel: Channel,
    slot: Slot,
    mut read_half: OwnedReadHalf,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    loop {
        tokio::select! {
            _ = channel.wait_for_read_window() => {}
            _ = stop_rx.recv() => break,
        }
        tokio::select! {
            result = read_half.read_buf(&mut buf) => {
                match result {
                    Ok(0) => {
                        trace!(channel = channel.id(), "socket closed by peer");
                        channel.shutdown(None);
                        break;
                    }
                    Ok(n) => {
                        channel.add_bytes_read(n as u64);
                        channel.debit_read_window(n);
                        let data = buf.split().freeze();
                        let slot = slot.clone();
                        let dispatch_channel = channel.clone();
                        channel.schedule_task("socket-read-dispatch", move || {
                            if let Err(err) = slot.pass_read_message(Message::new(data)) {
                                match err {
                                    // No handler ready for the bytes yet.
                                    ChannelError::InvalidState(_) => trace!(
                                        channel = dispatch_channel.id(),
                                        error = %err,
                                        "read message not consumed"
                                    ),
                                    other => {
                                        debug!(
                                            channel = dispatch_channel.id(),
                                            error = %other,
                                            "handler failed processing read message"
                                        );
                                        dispatch_channel.shutdown(Some(other));
                                    }
                                }
                            }
                        });
                        buf.reserve(READ_BUFFER_CAPACITY);
                    }
                    Err(err) => {
                        debug!(channel = channel.id(), error = %err, "socket read failed");
                        channel.shutdown(Some(err.into()));
                        break;
                    }
                }
            }
            _ = stop_rx.recv() => break,
        }
    }
}

async fn run_write_loop(
    channel: Channel,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
    mut write_half: OwnedWriteHalf,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = write_rx.recv() => {
                match message {
                    Some(data) => {
                        let len = data.len() as u64;
                        if let Err(err) = write_half.write_all(&data).await {
                            debug!(channel = channel.id(), error = %err, "socket write failed");
                            channel.shutdown(Some(err.into()));
                            break;
                        }
                        channel.add_bytes_written(len);
                    }
                    None => break,
                }
            }
            _ = stop_rx.recv() => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}
