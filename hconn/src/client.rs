//! Client connection bootstrap.
//!
//! `connect` starts one outbound channel through the injectable
//! socket-channel hook and turns the channel's setup/shutdown callbacks
//! into the user-facing connection lifecycle:
//!
//! - `on_setup` fires exactly once per successful `connect` call, with the
//!   connection on success or the error otherwise
//! - `on_shutdown` fires at most once, and only after a successful
//!   `on_setup`
//!
//! The transient bootstrap record tracks which of those has happened as an
//! explicit state machine rather than by nulling callback pointers.

use std::sync::Arc;

use hconn_chan::{
    Bootstrap, Channel, ChannelError, SocketChannelOptions, SocketOptions, TlsConnectionOptions,
};
use parking_lot::Mutex;
use tracing::{error, info, trace};

use crate::connection::factory::build_connection;
use crate::connection::h2::Http2ConnectionOptions;
use crate::connection::{Connection, UserData};
use crate::error::HttpError;
use crate::hooks;
use crate::monitor::{HttpConnectionMonitor, MonitoringOptions};
use crate::proxy::{self, ProxyOptions, ProxyRequestTransform};

/// Invoked exactly once per `connect` call with the outcome.
pub type OnClientConnectionSetup = Box<dyn FnOnce(Result<Connection, HttpError>) + Send>;

/// Invoked at most once, after a successful setup, when the connection has
/// finished shutting down.
pub type OnClientConnectionShutdown = Box<dyn FnOnce(Connection, Option<HttpError>) + Send>;

/// Options for [`connect`].
pub struct ClientConnectionOptions {
    pub bootstrap: Bootstrap,
    pub host_name: String,
    pub port: u16,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub manual_window_management: bool,
    pub initial_window_size: usize,
    pub user_data: Option<UserData>,
    pub on_setup: OnClientConnectionSetup,
    pub on_shutdown: Option<OnClientConnectionShutdown>,
    pub http2_options: Option<Http2ConnectionOptions>,
    pub monitoring_options: Option<MonitoringOptions>,
    pub proxy_options: Option<ProxyOptions>,
}

/// Callback-ordering state for one connect attempt.
enum SetupState {
    AwaitingSetup { on_setup: OnClientConnectionSetup },
    SetupComplete { connection: Connection },
    Terminal,
}

/// Transient record owned by the channel callbacks of one connect attempt.
struct ClientBootstrap {
    is_using_tls: bool,
    manual_window_management: bool,
    initial_window_size: usize,
    user_data: Option<UserData>,
    http2_options: Option<Http2ConnectionOptions>,
    monitoring_options: Option<MonitoringOptions>,
    proxy_request_transform: Option<ProxyRequestTransform>,
    state: Mutex<SetupState>,
    on_shutdown: Mutex<Option<OnClientConnectionShutdown>>,
}

/// Establish an outbound HTTP connection.
///
/// With proxy options present the connect is dispatched through the
/// proxy-capable path; otherwise the direct path is taken.
pub fn connect(options: ClientConnectionOptions) -> Result<(), HttpError> {
    if options.proxy_options.is_some() {
        proxy::connect_via_proxy(options)
    } else {
        connect_internal(options, None)
    }
}

pub(crate) fn connect_internal(
    options: ClientConnectionOptions,
    proxy_request_transform: Option<ProxyRequestTransform>,
) -> Result<(), HttpError> {
    validate_options(&options)?;

    let record = Arc::new(ClientBootstrap {
        is_using_tls: options.tls_options.is_some(),
        manual_window_management: options.manual_window_management,
        initial_window_size: options.initial_window_size,
        user_data: options.user_data,
        // Deep copy: the caller's settings array is not referenced again.
        http2_options: options.http2_options.clone(),
        monitoring_options: options.monitoring_options,
        proxy_request_transform,
        state: Mutex::new(SetupState::AwaitingSetup {
            on_setup: options.on_setup,
        }),
        on_shutdown: Mutex::new(options.on_shutdown),
    });

    trace!(
        host = %options.host_name,
        port = options.port,
        "initializing a new client channel"
    );

    let setup_record = Arc::clone(&record);
    let shutdown_record = record;
    let vtable = hooks::system_vtable();
    (vtable.new_socket_channel)(SocketChannelOptions {
        bootstrap: options.bootstrap,
        host_name: options.host_name,
        port: options.port,
        socket_options: options.socket_options,
        tls_options: options.tls_options,
        enable_read_back_pressure: options.manual_window_management,
        setup: Box::new(move |result| {
            ClientBootstrap::on_channel_setup(&setup_record, result);
        }),
        shutdown: Some(Box::new(move |channel, error| {
            ClientBootstrap::on_channel_shutdown(&shutdown_record, channel, error);
        })),
    })
    .map_err(|err| {
        error!(
            error = %err,
            "failed to initiate socket channel for new client connection"
        );
        HttpError::from(err)
    })
}

fn validate_options(options: &ClientConnectionOptions) -> Result<(), HttpError> {
    if options.host_name.is_empty() {
        error!("invalid connection options, empty host name");
        return Err(HttpError::InvalidArgument("empty host name"));
    }
    if options.socket_options.validate().is_err() {
        error!("invalid connection options, bad socket options");
        return Err(HttpError::InvalidArgument("invalid socket options"));
    }
    if let Some(monitoring) = &options.monitoring_options {
        if !monitoring.is_valid() {
            error!("invalid connection options, invalid monitoring options");
            return Err(HttpError::InvalidArgument("invalid monitoring options"));
        }
    }
    Ok(())
}

impl ClientBootstrap {
    /// The socket layer finished its connect attempt.
    fn on_channel_setup(record: &Arc<ClientBootstrap>, result: Result<Channel, ChannelError>) {
        let channel = match result {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = %err, "client connection failed");
                // No channel exists, so there will be no shutdown callback;
                // tell the user now and let the record drop.
                record.deliver_setup(Err(HttpError::from(err)));
                return;
            }
        };

        trace!(
            channel = channel.id(),
            "socket connected, creating client connection object"
        );
        let connection = match build_connection(
            &channel,
            false,
            record.is_using_tls,
            record.manual_window_management,
            record.initial_window_size,
            record.http2_options.as_ref(),
        ) {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = %err, "failed to create the client connection object");
                // Wait for channel shutdown to complete before informing
                // the user that setup failed.
                channel.shutdown(Some(err.to_channel_error()));
                return;
            }
        };

        if let Some(monitoring) = record.monitoring_options {
            // Options were validated at connect; validity here simply means
            // monitoring is enabled.
            if monitoring.is_valid() {
                channel.set_statistics_handler(Arc::new(HttpConnectionMonitor::new(monitoring)));
            }
        }

        connection.set_proxy_request_transform(record.proxy_request_transform.clone());
        connection.set_user_data(record.user_data.clone());

        info!(
            channel = channel.id(),
            version = %connection.version(),
            "client connection established"
        );

        let on_setup = {
            let mut state = record.state.lock();
            match std::mem::replace(
                &mut *state,
                SetupState::SetupComplete {
                    connection: connection.clone(),
                },
            ) {
                SetupState::AwaitingSetup { on_setup } => Some(on_setup),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(on_setup) = on_setup {
            on_setup(Ok(connection));
        }
    }

    /// The channel for this connect attempt has completed its shutdown.
    fn on_channel_shutdown(
        record: &Arc<ClientBootstrap>,
        _channel: &Channel,
        error: Option<ChannelError>,
    ) {
        let state = std::mem::replace(&mut *record.state.lock(), SetupState::Terminal);
        match state {
            SetupState::AwaitingSetup { on_setup } => {
                // Setup never succeeded; make sure the user sees an error.
                let err = error.map(HttpError::from).unwrap_or(HttpError::Unknown);
                error!(error = %err, "client setup failed");
                on_setup(Err(err));
            }
            SetupState::SetupComplete { connection } => {
                info!(
                    channel = connection.channel().id(),
                    "client shutdown completed"
                );
                if let Some(on_shutdown) = record.on_shutdown.lock().take() {
                    on_shutdown(connection, error.map(HttpError::from));
                }
            }
            SetupState::Terminal => {}
        }
    }

    fn deliver_setup(&self, result: Result<Connection, HttpError>) {
        let state = std::mem::replace(&mut *self.state.lock(), SetupState::Terminal);
        if let SetupState::AwaitingSetup { on_setup } = state {
            on_setup(result);
        }
    }
}
