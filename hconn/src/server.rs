//! HTTP server: listener lifecycle and child-connection tracking.
//!
//! The server owns one listening socket and a map of every live child
//! channel. Accept, shutdown and destroy arrive as bootstrap callbacks on
//! bootstrap-owned tasks; the server lock serializes the map and the
//! shutting-down flag against them. Once `release` has returned, no new
//! entry can be added, every child has been asked to shut down, and
//! `on_destroy_complete` will fire after the last child's shutdown
//! callback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use hconn_chan::{
    destroy_socket_listener, new_socket_listener, Bootstrap, Channel, ChannelError, Listener,
    OnChildChannelShutdown, OnIncomingChannel, OnListenerDestroy, ServerListenerOptions,
    SocketOptions, TlsConnectionOptions,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, trace};

use crate::connection::factory::build_connection;
use crate::connection::{Connection, UserData};
use crate::error::HttpError;

/// Listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Invoked for every accepted channel: with the new connection on success,
/// with the error otherwise. On success the user must call
/// `configure_server` on the connection before returning.
pub type OnIncomingConnection = Arc<dyn Fn(&HttpServer, Result<Connection, HttpError>) + Send + Sync>;

/// Invoked once, after every child connection has shut down and the
/// listener is gone.
pub type OnServerDestroyComplete = Box<dyn FnOnce() + Send>;

/// Options for [`HttpServer::new`].
pub struct HttpServerOptions {
    pub bootstrap: Bootstrap,
    pub endpoint: Endpoint,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub manual_window_management: bool,
    pub initial_window_size: usize,
    pub user_data: Option<UserData>,
    pub on_incoming_connection: OnIncomingConnection,
    pub on_destroy_complete: Option<OnServerDestroyComplete>,
}

struct ServerSynced {
    is_shutting_down: bool,
    listener: Option<Listener>,
    channel_to_connection: HashMap<u64, Connection>,
}

struct ServerInner {
    is_using_tls: bool,
    manual_window_management: bool,
    initial_window_size: usize,
    user_data: Option<UserData>,
    on_incoming_connection: OnIncomingConnection,
    on_destroy_complete: Mutex<Option<OnServerDestroyComplete>>,
    synced: Mutex<ServerSynced>,
}

/// Handle to a running HTTP server.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<ServerInner>,
}

impl HttpServer {
    /// Validate options, bind the listener, and start accepting.
    ///
    /// The server lock is held across listener creation: accept callbacks
    /// may start firing immediately, and must not observe a
    /// half-initialized listener field.
    pub fn new(options: HttpServerOptions) -> Result<HttpServer, HttpError> {
        if options.endpoint.host.is_empty() {
            error!("invalid options, cannot create server");
            return Err(HttpError::InvalidArgument("empty endpoint host"));
        }
        if options.socket_options.validate().is_err() {
            error!("invalid options, cannot create server");
            return Err(HttpError::InvalidArgument("invalid socket options"));
        }

        let inner = Arc::new(ServerInner {
            is_using_tls: options.tls_options.is_some(),
            manual_window_management: options.manual_window_management,
            initial_window_size: options.initial_window_size,
            user_data: options.user_data,
            on_incoming_connection: options.on_incoming_connection,
            on_destroy_complete: Mutex::new(options.on_destroy_complete),
            synced: Mutex::new(ServerSynced {
                is_shutting_down: false,
                listener: None,
                channel_to_connection: HashMap::new(),
            }),
        });

        let incoming: OnIncomingChannel = {
            let inner = Arc::clone(&inner);
            Arc::new(move |result| ServerInner::on_accept_channel_setup(&inner, result))
        };
        let shutdown: OnChildChannelShutdown = {
            let inner = Arc::clone(&inner);
            Arc::new(move |channel, error| {
                ServerInner::on_accept_channel_shutdown(&inner, channel, error)
            })
        };
        let destroy: OnListenerDestroy = {
            let inner = Arc::clone(&inner);
            Box::new(move || ServerInner::on_listener_destroy(&inner))
        };

        let local_addr;
        {
            let mut synced = inner.synced.lock();
            let listener = new_socket_listener(ServerListenerOptions {
                bootstrap: options.bootstrap,
                host_name: options.endpoint.host.clone(),
                port: options.endpoint.port,
                socket_options: options.socket_options,
                tls_options: options.tls_options,
                enable_read_back_pressure: options.manual_window_management,
                incoming,
                shutdown,
                destroy,
            })
            .map_err(|err| {
                error!(
                    error = %err,
                    "failed creating new socket listener, cannot create server"
                );
                HttpError::from(err)
            })?;
            local_addr = listener.local_addr();
            synced.listener = Some(listener);
        }

        info!(addr = %local_addr, "server setup complete, listening for incoming connections");
        Ok(HttpServer { inner })
    }

    /// Address the listener is bound to, until `release` has been called.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .synced
            .lock()
            .listener
            .as_ref()
            .map(Listener::local_addr)
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.inner.user_data.clone()
    }

    /// Begin asynchronous teardown. Idempotent.
    ///
    /// Every live child channel is asked to shut down with
    /// `ConnectionClosed`; the listener destroy completes in the background
    /// and ends with `on_destroy_complete`.
    pub fn release(&self) {
        let listener = {
            let mut synced = self.inner.synced.lock();
            if synced.is_shutting_down {
                trace!("the server is already shutting down");
                return;
            }
            synced.is_shutting_down = true;
            // With the lock held, no new child can be inserted behind the
            // flag; shut down everything currently live.
            for connection in synced.channel_to_connection.values() {
                connection.channel().shutdown(Some(ChannelError::Closed));
            }
            synced.listener.take()
        };

        info!("shutting down the server");
        if let Some(listener) = listener {
            destroy_socket_listener(listener);
        }
        // Clean up continues from the bootstrap callbacks once every child
        // has finished shutting down.
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl ServerInner {
    /// The bootstrap accepted an incoming channel (or failed to).
    fn on_accept_channel_setup(inner: &Arc<ServerInner>, result: Result<Channel, ChannelError>) {
        let server = HttpServer {
            inner: Arc::clone(inner),
        };
        let channel = match result {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = %err, "incoming connection failed");
                (inner.on_incoming_connection)(&server, Err(HttpError::from(err)));
                return;
            }
        };

        let connection = match build_connection(
            &channel,
            true,
            inner.is_using_tls,
            inner.manual_window_management,
            inner.initial_window_size,
            None,
        ) {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = %err, "failed to create connection object");
                (inner.on_incoming_connection)(&server, Err(err.clone()));
                channel.shutdown(Some(err.to_channel_error()));
                return;
            }
        };

        // Re-check under the lock: release() may have been called between
        // the accept and this callback.
        let rejected = {
            let mut synced = inner.synced.lock();
            if synced.is_shutting_down {
                true
            } else {
                synced
                    .channel_to_connection
                    .insert(channel.id(), connection.clone());
                false
            }
        };
        if rejected {
            error!(
                channel = channel.id(),
                "incoming connection failed, the server is shutting down"
            );
            (inner.on_incoming_connection)(&server, Err(HttpError::ConnectionClosed));
            channel.shutdown(Some(ChannelError::Closed));
            // The user-side reference was never handed out.
            connection.release();
            return;
        }

        info!(
            channel = channel.id(),
            version = %connection.version(),
            "server connection established"
        );
        (inner.on_incoming_connection)(&server, Ok(connection.clone()));

        // The user must configure the connection during the callback.
        if !connection.is_server_configured() {
            error!(
                channel = channel.id(),
                "caller failed to configure the connection during the \
                 on_incoming_connection callback, closing connection"
            );
            channel.shutdown(Some(HttpError::ReactionRequired.to_channel_error()));
            connection.release();
        }
    }

    /// A child channel completed its shutdown. The entry is missing when
    /// setup failed before insertion; that is legal.
    fn on_accept_channel_shutdown(
        inner: &Arc<ServerInner>,
        channel: &Channel,
        error: Option<ChannelError>,
    ) {
        let connection = inner
            .synced
            .lock()
            .channel_to_connection
            .remove(&channel.id());
        if let Some(connection) = connection {
            info!(channel = channel.id(), "server connection shut down");
            if let Some(on_shutdown) = connection.take_server_on_shutdown() {
                on_shutdown(connection.clone(), error.map(HttpError::from));
            }
        }
    }

    /// The listener and every child are gone; finish the teardown.
    fn on_listener_destroy(inner: &Arc<ServerInner>) {
        info!("server listener destroy complete");
        if let Some(on_destroy_complete) = inner.on_destroy_complete.lock().take() {
            on_destroy_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ServerConnectionOptions;
    use crossbeam_channel::bounded;
    use hconn_chan::ChannelOptions;
    use std::time::Duration;

    fn bare_channel() -> Channel {
        Channel::new(ChannelOptions {
            bootstrap: Bootstrap::current().unwrap(),
            host_address: None,
            on_shutdown: None,
            enable_read_back_pressure: false,
        })
    }

    /// Inner with no real listener, for driving the accept callbacks
    /// directly.
    fn test_inner(
        on_incoming_connection: OnIncomingConnection,
    ) -> Arc<ServerInner> {
        Arc::new(ServerInner {
            is_using_tls: false,
            manual_window_management: false,
            initial_window_size: 65_535,
            user_data: None,
            on_incoming_connection,
            on_destroy_complete: Mutex::new(None),
            synced: Mutex::new(ServerSynced {
                is_shutting_down: false,
                listener: None,
                channel_to_connection: HashMap::new(),
            }),
        })
    }

    #[tokio::test]
    async fn accept_racing_release_is_rejected_with_connection_closed() {
        let (tx, rx) = bounded(4);
        let inner = test_inner(Arc::new(move |_server, result| {
            tx.send(result.map(|_| ())).unwrap();
        }));

        // release() already ran: the flag is up before the accept callback.
        inner.synced.lock().is_shutting_down = true;

        let channel = bare_channel();
        ServerInner::on_accept_channel_setup(&inner, Ok(channel.clone()));

        assert_eq!(rx.try_recv().unwrap(), Err(HttpError::ConnectionClosed));
        assert!(channel.is_shutting_down());
        assert!(inner.synced.lock().channel_to_connection.is_empty());
    }

    #[tokio::test]
    async fn missing_configure_forces_reaction_required_shutdown() {
        let (tx, rx) = bounded(4);
        // The callback receives a healthy connection but never configures it.
        let inner = test_inner(Arc::new(move |_server, result| {
            tx.send(result.is_ok()).unwrap();
        }));

        let channel = bare_channel();
        ServerInner::on_accept_channel_setup(&inner, Ok(channel.clone()));

        assert!(rx.try_recv().unwrap());
        assert!(channel.is_shutting_down());
    }

    #[tokio::test]
    async fn configured_connection_is_tracked_until_channel_shutdown() {
        let (shutdown_tx, shutdown_rx) = bounded(4);
        let inner = test_inner(Arc::new(move |_server, result| {
            let connection = result.unwrap();
            let shutdown_tx = shutdown_tx.clone();
            connection
                .configure_server(ServerConnectionOptions {
                    on_incoming_request: Arc::new(|_connection| None),
                    on_shutdown: Some(Box::new(move |_connection, error| {
                        shutdown_tx.send(error).unwrap();
                    })),
                    connection_user_data: None,
                })
                .unwrap();
        }));

        let channel = bare_channel();
        ServerInner::on_accept_channel_setup(&inner, Ok(channel.clone()));
        assert!(!channel.is_shutting_down());
        assert_eq!(inner.synced.lock().channel_to_connection.len(), 1);

        ServerInner::on_accept_channel_shutdown(&inner, &channel, Some(ChannelError::Closed));
        assert_eq!(
            shutdown_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Some(HttpError::ConnectionClosed)
        );
        assert!(inner.synced.lock().channel_to_connection.is_empty());

        // A second shutdown for the same channel finds nothing; that's legal.
        ServerInner::on_accept_channel_shutdown(&inner, &channel, None);
        channel.shutdown(None);
    }

    #[tokio::test]
    async fn accept_error_reaches_the_user() {
        let (tx, rx) = bounded(4);
        let inner = test_inner(Arc::new(move |_server, result| {
            tx.send(result.err()).unwrap();
        }));
        ServerInner::on_accept_channel_setup(
            &inner,
            Err(ChannelError::Socket {
                kind: std::io::ErrorKind::ConnectionReset,
                message: "reset".to_string(),
            }),
        );
        assert!(rx.try_recv().unwrap().is_some());
    }
}
