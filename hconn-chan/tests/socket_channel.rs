//! Integration tests for the socket bootstrap: loopback listener plus
//! outbound channels, byte flow through handlers, and the listener destroy
//! ordering contract.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use hconn_chan::{
    destroy_socket_listener, new_socket_channel, new_socket_listener, Bootstrap, Channel,
    ChannelError, ChannelHandler, Message, ServerListenerOptions, Slot, SocketChannelOptions,
    SocketOptions,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal handler that forwards every read payload into a test channel.
struct CaptureHandler {
    reads: Sender<Vec<u8>>,
}

impl ChannelHandler for CaptureHandler {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn process_read_message(&self, _slot: &Slot, message: Message) -> Result<(), ChannelError> {
        let _ = self.reads.send(message.data.to_vec());
        Ok(())
    }

    fn process_write_message(&self, slot: &Slot, message: Message) -> Result<(), ChannelError> {
        // Pass-through: forward writes toward the socket.
        slot.send_write_message(message)
    }

    fn on_channel_shutdown(&self, _error: Option<ChannelError>) {}
}

fn install_capture(channel: &Channel) -> Receiver<Vec<u8>> {
    let (tx, rx) = bounded(16);
    let slot = channel.append_slot().unwrap();
    slot.set_handler(Arc::new(CaptureHandler { reads: tx })).unwrap();
    rx
}

struct ListenerFixture {
    listener: hconn_chan::Listener,
    accepted: Receiver<Channel>,
    child_shutdowns: Receiver<Option<ChannelError>>,
    destroyed: Receiver<()>,
}

fn start_listener(bootstrap: &Bootstrap) -> ListenerFixture {
    let (accept_tx, accepted) = bounded(16);
    let (shut_tx, child_shutdowns) = bounded(16);
    let (destroy_tx, destroyed) = bounded(1);

    let listener = new_socket_listener(ServerListenerOptions {
        bootstrap: bootstrap.clone(),
        host_name: "127.0.0.1".to_string(),
        port: 0,
        socket_options: SocketOptions::default(),
        tls_options: None,
        enable_read_back_pressure: false,
        incoming: Arc::new(move |result| {
            accept_tx.send(result.unwrap()).unwrap();
        }),
        shutdown: Arc::new(move |_channel, error| {
            shut_tx.send(error).unwrap();
        }),
        destroy: Box::new(move || {
            destroy_tx.send(()).unwrap();
        }),
    })
    .unwrap();

    ListenerFixture {
        listener,
        accepted,
        child_shutdowns,
        destroyed,
    }
}

fn connect(bootstrap: &Bootstrap, port: u16) -> (Receiver<Channel>, Receiver<Option<ChannelError>>) {
    let (setup_tx, setup_rx) = bounded(1);
    let (shut_tx, shut_rx) = bounded(1);
    new_socket_channel(SocketChannelOptions {
        bootstrap: bootstrap.clone(),
        host_name: "127.0.0.1".to_string(),
        port,
        socket_options: SocketOptions::default(),
        tls_options: None,
        enable_read_back_pressure: false,
        setup: Box::new(move |result| {
            setup_tx.send(result.unwrap()).unwrap();
        }),
        shutdown: Some(Box::new(move |_channel, error| {
            let _ = shut_tx.send(error);
        })),
    })
    .unwrap();
    (setup_rx, shut_rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn bytes_flow_between_client_and_server_channels() {
    let bootstrap = Bootstrap::current().unwrap();
    let fixture = start_listener(&bootstrap);
    let port = fixture.listener.local_addr().port();

    let (setup_rx, _shut_rx) = connect(&bootstrap, port);
    let client = setup_rx.recv_timeout(TIMEOUT).unwrap();
    let server = fixture.accepted.recv_timeout(TIMEOUT).unwrap();

    let client_reads = install_capture(&client);
    let server_reads = install_capture(&server);

    let client_slot = client.append_slot().unwrap();
    client_slot
        .send_write_message(Message::new(bytes::Bytes::from_static(b"ping")))
        .unwrap();
    assert_eq!(server_reads.recv_timeout(TIMEOUT).unwrap(), b"ping");

    let server_slot = server.append_slot().unwrap();
    server_slot
        .send_write_message(Message::new(bytes::Bytes::from_static(b"pong")))
        .unwrap();
    assert_eq!(client_reads.recv_timeout(TIMEOUT).unwrap(), b"pong");

    client.shutdown(None);
    server.shutdown(None);
    destroy_socket_listener(fixture.listener);
    fixture.destroyed.recv_timeout(TIMEOUT).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_reports_through_setup_only() {
    let bootstrap = Bootstrap::current().unwrap();
    let (setup_tx, setup_rx) = bounded(1);
    let (shut_tx, shut_rx) = bounded::<Option<ChannelError>>(1);

    // Port 1 on loopback: nothing is listening there.
    new_socket_channel(SocketChannelOptions {
        bootstrap,
        host_name: "127.0.0.1".to_string(),
        port: 1,
        socket_options: SocketOptions::default(),
        tls_options: None,
        enable_read_back_pressure: false,
        setup: Box::new(move |result| {
            setup_tx.send(result.err()).unwrap();
        }),
        shutdown: Some(Box::new(move |_channel, error| {
            shut_tx.send(error).unwrap();
        })),
    })
    .unwrap();

    let error = setup_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(error.is_some(), "setup must carry the connect error");
    assert!(
        shut_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "no shutdown callback without a channel"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_close_drives_channel_shutdown() {
    let bootstrap = Bootstrap::current().unwrap();
    let fixture = start_listener(&bootstrap);
    let port = fixture.listener.local_addr().port();

    let (setup_rx, shut_rx) = connect(&bootstrap, port);
    let client = setup_rx.recv_timeout(TIMEOUT).unwrap();
    let server = fixture.accepted.recv_timeout(TIMEOUT).unwrap();
    let _ = install_capture(&client);

    server.shutdown(None);
    fixture.child_shutdowns.recv_timeout(TIMEOUT).unwrap();

    // The client observes EOF and completes its own shutdown.
    shut_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(client.is_shutting_down());

    destroy_socket_listener(fixture.listener);
    fixture.destroyed.recv_timeout(TIMEOUT).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_fires_after_every_child_shutdown() {
    let bootstrap = Bootstrap::current().unwrap();
    let fixture = start_listener(&bootstrap);
    let port = fixture.listener.local_addr().port();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (setup_rx, _) = connect(&bootstrap, port);
        clients.push(setup_rx.recv_timeout(TIMEOUT).unwrap());
        fixture.accepted.recv_timeout(TIMEOUT).unwrap();
    }

    destroy_socket_listener(fixture.listener);

    // All three child shutdown callbacks come before the destroy callback.
    for _ in 0..3 {
        let error = fixture.child_shutdowns.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(error, Some(ChannelError::Closed));
    }
    fixture.destroyed.recv_timeout(TIMEOUT).unwrap();
    assert!(fixture.child_shutdowns.try_recv().is_err());
}
