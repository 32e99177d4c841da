//! Connection factory: the one place where protocol choice, channel
//! topology and connection construction meet.
//!
//! Given a freshly established channel, the factory appends a slot at the
//! tail, decides the protocol version (from the TLS handler's negotiated
//! ALPN when TLS is in use, HTTP/1.1 otherwise), builds the matching
//! connection object and installs it as the slot's handler.

use std::sync::Arc;

use hconn_chan::{Channel, Slot};
use tracing::{debug, error, info, warn};

use crate::error::HttpError;

use super::h1::Http1Connection;
use super::h2::{Http2Connection, Http2ConnectionOptions};
use super::{Connection, HttpVersion, ProtocolConnection};

const ALPN_HTTP_1_1: &[u8] = b"http/1.1";
const ALPN_HTTP_2: &[u8] = b"h2";

/// Build a protocol-versioned connection and splice it into `channel`.
pub(crate) fn build_connection(
    channel: &Channel,
    is_server: bool,
    is_using_tls: bool,
    manual_window_management: bool,
    initial_window_size: usize,
    http2_options: Option<&Http2ConnectionOptions>,
) -> Result<Connection, HttpError> {
    let slot = channel.append_slot().map_err(|err| {
        error!(
            channel = channel.id(),
            error = %err,
            "failed to create slot in channel"
        );
        HttpError::from(err)
    })?;

    match build_in_slot(
        channel,
        &slot,
        is_server,
        is_using_tls,
        manual_window_management,
        initial_window_size,
        http2_options,
    ) {
        Ok(connection) => Ok(connection),
        Err(err) => {
            slot.remove();
            Err(err)
        }
    }
}

fn build_in_slot(
    channel: &Channel,
    slot: &Slot,
    is_server: bool,
    is_using_tls: bool,
    manual_window_management: bool,
    initial_window_size: usize,
    http2_options: Option<&Http2ConnectionOptions>,
) -> Result<Connection, HttpError> {
    let version = if is_using_tls {
        negotiated_version(channel, slot)?
    } else {
        HttpVersion::Http1_1
    };

    let proto: Arc<dyn ProtocolConnection> = match version {
        HttpVersion::Http1_1 => {
            if is_server {
                Http1Connection::new_server(
                    channel.clone(),
                    manual_window_management,
                    initial_window_size,
                )
            } else {
                Http1Connection::new_client(
                    channel.clone(),
                    manual_window_management,
                    initial_window_size,
                )
            }
        }
        HttpVersion::Http2 => {
            if is_server {
                Http2Connection::new_server(channel.clone(), manual_window_management, http2_options)
            } else {
                Http2Connection::new_client(channel.clone(), manual_window_management, http2_options)
            }
        }
    };

    slot.set_handler(proto.clone().as_channel_handler())
        .map_err(|err| {
            error!(
                channel = channel.id(),
                error = %err,
                "failed to set connection handler into slot"
            );
            HttpError::from(err)
        })?;

    // Installation is complete; let the implementation finalize its
    // in-channel state.
    proto.on_handler_installed(slot);

    info!(
        channel = channel.id(),
        version = %version,
        server = is_server,
        "connection object created"
    );
    Ok(Connection { proto })
}

/// Query the TLS handler on the inbound side for the negotiated protocol.
fn negotiated_version(channel: &Channel, slot: &Slot) -> Result<HttpVersion, HttpError> {
    let tls_handler = slot.adjacent_left().and_then(|left| left.handler());
    let Some(tls_handler) = tls_handler else {
        error!(channel = channel.id(), "failed to find TLS handler in channel");
        return Err(HttpError::InvalidState(
            "no tls handler on the inbound side of the connection slot",
        ));
    };

    let Some(protocol) = tls_handler.alpn_protocol() else {
        return Ok(HttpVersion::Http1_1);
    };
    if protocol.is_empty() || protocol.as_ref() == ALPN_HTTP_1_1 {
        Ok(HttpVersion::Http1_1)
    } else if protocol.as_ref() == ALPN_HTTP_2 {
        Ok(HttpVersion::Http2)
    } else {
        warn!(
            channel = channel.id(),
            "unrecognized ALPN protocol, assuming HTTP/1.1"
        );
        debug!(
            channel = channel.id(),
            protocol = %String::from_utf8_lossy(&protocol),
            "unrecognized ALPN protocol"
        );
        Ok(HttpVersion::Http1_1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hconn_chan::{
        Bootstrap, ChannelError, ChannelHandler, ChannelOptions, HandlerRef, Message,
    };

    /// Stand-in for the TLS handler: only the ALPN query matters here.
    struct StubTlsHandler {
        protocol: Option<&'static [u8]>,
    }

    impl ChannelHandler for StubTlsHandler {
        fn name(&self) -> &'static str {
            "stub-tls"
        }
        fn process_read_message(
            &self,
            slot: &Slot,
            message: Message,
        ) -> Result<(), ChannelError> {
            slot.pass_read_message(message)
        }
        fn process_write_message(
            &self,
            slot: &Slot,
            message: Message,
        ) -> Result<(), ChannelError> {
            slot.send_write_message(message)
        }
        fn on_channel_shutdown(&self, _error: Option<ChannelError>) {}
        fn alpn_protocol(&self) -> Option<Bytes> {
            self.protocol.map(Bytes::from_static)
        }
    }

    fn bare_channel() -> Channel {
        Channel::new(ChannelOptions {
            bootstrap: Bootstrap::current().unwrap(),
            host_address: None,
            on_shutdown: None,
            enable_read_back_pressure: false,
        })
    }

    fn channel_with_tls(protocol: Option<&'static [u8]>) -> Channel {
        let channel = bare_channel();
        let slot = channel.append_slot().unwrap();
        let handler: HandlerRef = Arc::new(StubTlsHandler { protocol });
        slot.set_handler(handler).unwrap();
        channel
    }

    #[tokio::test]
    async fn plaintext_defaults_to_http11() {
        let channel = bare_channel();
        let conn = build_connection(&channel, false, false, false, 65_535, None).unwrap();
        assert_eq!(conn.version(), HttpVersion::Http1_1);
        assert!(conn.is_client());
        conn.release();
    }

    #[tokio::test]
    async fn alpn_h2_selects_http2() {
        let channel = channel_with_tls(Some(b"h2"));
        let conn = build_connection(&channel, false, true, false, 65_535, None).unwrap();
        assert_eq!(conn.version(), HttpVersion::Http2);
        assert!(conn.http2().is_ok());
        conn.release();
    }

    #[tokio::test]
    async fn alpn_http11_selects_http11() {
        let channel = channel_with_tls(Some(b"http/1.1"));
        let conn = build_connection(&channel, true, true, false, 65_535, None).unwrap();
        assert_eq!(conn.version(), HttpVersion::Http1_1);
        assert!(conn.is_server());
        conn.release();
    }

    #[tokio::test]
    async fn unknown_alpn_falls_back_to_http11() {
        let channel = channel_with_tls(Some(b"spdy/3"));
        let conn = build_connection(&channel, false, true, false, 65_535, None).unwrap();
        assert_eq!(conn.version(), HttpVersion::Http1_1);
        conn.release();
    }

    #[tokio::test]
    async fn empty_alpn_falls_back_to_http11() {
        let channel = channel_with_tls(Some(b""));
        let conn = build_connection(&channel, false, true, false, 65_535, None).unwrap();
        assert_eq!(conn.version(), HttpVersion::Http1_1);
        conn.release();
    }

    #[tokio::test]
    async fn missing_tls_handler_is_invalid_state() {
        // TLS claimed but no handler occupies the inbound side.
        let channel = bare_channel();
        let err = build_connection(&channel, false, true, false, 65_535, None).unwrap_err();
        assert!(matches!(err, HttpError::InvalidState(_)));
        channel.shutdown(None);
    }

    #[tokio::test]
    async fn failed_build_leaves_no_slot_behind() {
        let channel = bare_channel();
        let _ = build_connection(&channel, false, true, false, 65_535, None).unwrap_err();
        // The connection slot was removed again; the chain is empty, so a
        // new slot has no inbound neighbor.
        let probe = channel.append_slot().unwrap();
        assert!(probe.adjacent_left().is_none());
        channel.shutdown(None);
    }

    #[tokio::test]
    async fn http2_only_call_on_http11_connection_fails() {
        let channel = bare_channel();
        let conn = build_connection(&channel, false, false, false, 65_535, None).unwrap();
        assert!(matches!(
            conn.http2().unwrap_err(),
            HttpError::InvalidState(_)
        ));
        assert!(matches!(
            conn.ping(None, None).unwrap_err(),
            HttpError::InvalidState(_)
        ));
        assert!(matches!(
            conn.local_settings().unwrap_err(),
            HttpError::InvalidState(_)
        ));
        conn.release();
    }
}
