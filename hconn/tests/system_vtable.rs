//! Tests that exercise the swappable system vtable: synthetic channels,
//! synchronous failures, and ALPN-driven protocol selection at the
//! `connect` boundary.
//!
//! The vtable is process-wide, so every test here serializes on one guard
//! and restores the default table before releasing it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use hconn::{
    connect, reset_system_vtable, set_system_vtable, ClientConnectionOptions, Connection,
    HttpError, HttpVersion, SystemVtable,
};
use hconn_chan::{
    Bootstrap, Channel, ChannelError, ChannelHandler, ChannelOptions, Message, Slot,
    SocketOptions, TlsConnectionOptions,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

const TIMEOUT: Duration = Duration::from_secs(5);

static VTABLE_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Hold the guard for the duration of a vtable swap.
fn lock_vtable() -> MutexGuard<'static, ()> {
    VTABLE_GUARD.lock()
}

/// Stand-in TLS handler reporting a fixed negotiated protocol.
struct StubTlsHandler {
    protocol: &'static [u8],
}

impl ChannelHandler for StubTlsHandler {
    fn name(&self) -> &'static str {
        "stub-tls"
    }
    fn process_read_message(&self, slot: &Slot, message: Message) -> Result<(), ChannelError> {
        slot.pass_read_message(message)
    }
    fn process_write_message(&self, slot: &Slot, message: Message) -> Result<(), ChannelError> {
        slot.send_write_message(message)
    }
    fn on_channel_shutdown(&self, _error: Option<ChannelError>) {}
    fn alpn_protocol(&self) -> Option<Bytes> {
        Some(Bytes::from_static(self.protocol))
    }
}

/// Vtable whose socket factory produces a bare in-process channel,
/// optionally fronted by a stub TLS handler.
fn synthetic_channel_vtable(
    alpn: Option<&'static [u8]>,
) -> (SystemVtable, Receiver<Channel>) {
    let (channel_tx, channel_rx) = bounded(4);
    let vtable = SystemVtable {
        new_socket_channel: Arc::new(move |options| {
            let channel = Channel::new(ChannelOptions {
                bootstrap: options.bootstrap.clone(),
                host_address: Some(format!("{}:{}", options.host_name, options.port)),
                on_shutdown: options.shutdown,
                enable_read_back_pressure: options.enable_read_back_pressure,
            });
            if let Some(protocol) = alpn {
                let slot = channel.append_slot()?;
                slot.set_handler(Arc::new(StubTlsHandler { protocol }))?;
            }
            let _ = channel_tx.send(channel.clone());
            (options.setup)(Ok(channel));
            Ok(())
        }),
    };
    (vtable, channel_rx)
}

fn client_options(
    bootstrap: &Bootstrap,
    tls: bool,
) -> (
    ClientConnectionOptions,
    Receiver<Result<Connection, HttpError>>,
    Receiver<Option<HttpError>>,
) {
    let (setup_tx, setup_rx) = bounded(1);
    let (shut_tx, shut_rx) = bounded(1);
    let options = ClientConnectionOptions {
        bootstrap: bootstrap.clone(),
        host_name: "synthetic.test".to_string(),
        port: 443,
        socket_options: SocketOptions::default(),
        tls_options: tls.then(|| TlsConnectionOptions {
            server_name: "synthetic.test".to_string(),
            alpn_list: vec!["h2".to_string(), "http/1.1".to_string()],
        }),
        manual_window_management: false,
        initial_window_size: 65_535,
        user_data: None,
        on_setup: Box::new(move |result| {
            setup_tx.send(result).unwrap();
        }),
        on_shutdown: Some(Box::new(move |_connection, error| {
            shut_tx.send(error).unwrap();
        })),
        http2_options: None,
        monitoring_options: None,
        proxy_options: None,
    };
    (options, setup_rx, shut_rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn synchronous_hook_failure_fires_setup_once_and_no_shutdown() {
    let _guard = lock_vtable();
    set_system_vtable(SystemVtable {
        new_socket_channel: Arc::new(|options| {
            // The connect attempt dies before a channel exists.
            (options.setup)(Err(ChannelError::Socket {
                kind: std::io::ErrorKind::ConnectionRefused,
                message: "synthetic refusal".to_string(),
            }));
            Ok(())
        }),
    });

    let bootstrap = Bootstrap::current().unwrap();
    let (options, setup_rx, shut_rx) = client_options(&bootstrap, false);
    connect(options).unwrap();

    let result = setup_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(result.is_err());
    assert!(setup_rx.try_recv().is_err(), "setup fires exactly once");
    assert!(
        shut_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "no shutdown callback without a successful setup"
    );

    reset_system_vtable();
}

#[tokio::test(flavor = "multi_thread")]
async fn hook_error_return_fails_connect_synchronously() {
    let _guard = lock_vtable();
    set_system_vtable(SystemVtable {
        new_socket_channel: Arc::new(|_options| {
            Err(ChannelError::InvalidState("factory unavailable"))
        }),
    });

    let bootstrap = Bootstrap::current().unwrap();
    let (options, setup_rx, _shut_rx) = client_options(&bootstrap, false);
    assert!(connect(options).is_err());
    assert!(
        setup_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "a synchronous connect error never reaches the setup callback"
    );

    reset_system_vtable();
}

#[tokio::test(flavor = "multi_thread")]
async fn alpn_h2_yields_http2_connection_through_connect() {
    let _guard = lock_vtable();
    let (vtable, _channels) = synthetic_channel_vtable(Some(b"h2"));
    set_system_vtable(vtable);

    let bootstrap = Bootstrap::current().unwrap();
    let (options, setup_rx, _shut_rx) = client_options(&bootstrap, true);
    connect(options).unwrap();

    let connection = setup_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(connection.version(), HttpVersion::Http2);
    assert!(connection.http2().is_ok());
    connection.release();

    reset_system_vtable();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_alpn_yields_http11_connection_through_connect() {
    let _guard = lock_vtable();
    let (vtable, _channels) = synthetic_channel_vtable(Some(b"spdy/3"));
    set_system_vtable(vtable);

    let bootstrap = Bootstrap::current().unwrap();
    let (options, setup_rx, _shut_rx) = client_options(&bootstrap, true);
    connect(options).unwrap();

    let connection = setup_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(connection.version(), HttpVersion::Http1_1);
    assert!(matches!(
        connection.http2().unwrap_err(),
        HttpError::InvalidState(_)
    ));
    connection.release();

    reset_system_vtable();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_follows_setup_on_synthetic_channels() {
    let _guard = lock_vtable();
    let (vtable, channels) = synthetic_channel_vtable(None);
    set_system_vtable(vtable);

    let bootstrap = Bootstrap::current().unwrap();
    let (options, setup_rx, shut_rx) = client_options(&bootstrap, false);
    connect(options).unwrap();

    let connection = setup_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(connection.version(), HttpVersion::Http1_1);

    // Shut the synthetic channel down; the user's shutdown callback fires
    // exactly once, after setup.
    let channel = channels.recv_timeout(TIMEOUT).unwrap();
    channel.shutdown(Some(ChannelError::Closed));

    let error = shut_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(error, Some(HttpError::ConnectionClosed));
    assert!(shut_rx.try_recv().is_err());
    connection.release();

    reset_system_vtable();
}
