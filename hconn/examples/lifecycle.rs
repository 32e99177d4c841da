//! Connection lifecycle demo: a loopback server and one client, wired
//! through the callback surface.
//!
//! Run with: cargo run --example lifecycle

use std::sync::Arc;
use std::time::Duration;

use hconn::{
    connect, ClientConnectionOptions, Endpoint, H1Stream, HttpServer, HttpServerOptions, Request,
    ServerConnectionOptions,
};
use hconn_chan::{Bootstrap, SocketOptions};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let bootstrap = Bootstrap::current().expect("runtime");

    let server = HttpServer::new(HttpServerOptions {
        bootstrap: bootstrap.clone(),
        endpoint: Endpoint {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        socket_options: SocketOptions::default(),
        tls_options: None,
        manual_window_management: false,
        initial_window_size: 65_535,
        user_data: None,
        on_incoming_connection: Arc::new(|_server, result| {
            let connection = match result {
                Ok(connection) => connection,
                Err(err) => {
                    info!(error = %err, "incoming connection failed");
                    return;
                }
            };
            info!(version = %connection.version(), "server accepted a connection");
            connection
                .configure_server(ServerConnectionOptions {
                    on_incoming_request: Arc::new(|conn| {
                        info!("incoming request, creating handler stream");
                        let h1 = conn.http1().ok()?;
                        H1Stream::new_request_handler(&h1).ok()
                    }),
                    on_shutdown: Some(Box::new(|_connection, error| {
                        info!(error = ?error, "server connection shut down");
                    })),
                    connection_user_data: None,
                })
                .expect("configure once");
        }),
        on_destroy_complete: Some(Box::new(|| {
            info!("server destroy complete");
        })),
    })
    .expect("server");

    let port = server.local_addr().expect("bound").port();
    info!(port, "server listening");

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    connect(ClientConnectionOptions {
        bootstrap,
        host_name: "127.0.0.1".to_string(),
        port,
        socket_options: SocketOptions::default(),
        tls_options: None,
        manual_window_management: false,
        initial_window_size: 65_535,
        user_data: None,
        on_setup: Box::new(move |result| {
            let connection = result.expect("setup");
            info!(version = %connection.version(), "client connected");
            let _ = done_tx.send(connection);
        }),
        on_shutdown: Some(Box::new(|_connection, error| {
            info!(error = ?error, "client connection shut down");
        })),
        http2_options: None,
        monitoring_options: None,
        proxy_options: None,
    })
    .expect("connect");

    let connection = done_rx.await.expect("client setup");
    // Let the server finish installing its side before sending.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut request = Request::new();
    request.set_method("GET");
    request.set_path("/hello");
    request.set_body(bytes::Bytes::from_static(b"hi there"));

    let h1 = connection.http1().expect("http/1.1");
    let stream = H1Stream::new_request(
        &h1,
        hconn::ClientStreamOptions {
            request,
            on_complete: Some(Box::new(|stream, error| {
                info!(id = ?stream.id(), error = ?error, "request stream complete");
            })),
            user_data: None,
            manual_window_management: false,
        },
    )
    .expect("stream");
    stream.activate().expect("activate");
    tokio::time::sleep(Duration::from_millis(500)).await;

    stream.release();
    connection.release();
    server.release();
    tokio::time::sleep(Duration::from_millis(500)).await;
}
