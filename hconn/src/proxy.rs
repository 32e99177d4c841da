//! HTTP proxy dispatch.
//!
//! With proxy options present, the socket connects to the proxy endpoint
//! instead of the origin, and a request transform is installed on the
//! resulting connection. The transform applied here rewrites origin-form
//! request targets into absolute form so the proxy can route them; richer
//! transforms (authentication, tunneling) can be layered on by the
//! embedder.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::client::{connect_internal, ClientConnectionOptions};
use crate::error::HttpError;
use crate::request::Request;

/// Rewrites an outgoing request before it is encoded.
pub type ProxyRequestTransform = Arc<dyn Fn(&mut Request) -> Result<(), HttpError> + Send + Sync>;

/// Proxy endpoint to connect through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    pub host_name: String,
    pub port: u16,
}

/// Proxy-capable connect path: point the socket at the proxy and install
/// the request transform.
pub(crate) fn connect_via_proxy(mut options: ClientConnectionOptions) -> Result<(), HttpError> {
    let proxy = options
        .proxy_options
        .take()
        .ok_or(HttpError::InvalidArgument("proxy options are required"))?;
    if proxy.host_name.is_empty() {
        error!("invalid proxy options, empty host name");
        return Err(HttpError::InvalidArgument("empty proxy host name"));
    }

    info!(
        proxy = %proxy.host_name,
        port = proxy.port,
        origin = %options.host_name,
        "connecting through proxy"
    );

    let transform = absolute_target_transform(options.host_name.clone(), options.port);
    options.host_name = proxy.host_name;
    options.port = proxy.port;
    connect_internal(options, Some(transform))
}

/// Transform that rewrites origin-form targets ("/index.html") into
/// absolute form ("http://origin:port/index.html"). Targets already in
/// absolute form pass through untouched.
fn absolute_target_transform(origin_host: String, origin_port: u16) -> ProxyRequestTransform {
    Arc::new(move |request: &mut Request| {
        let path = request.path()?.clone();
        if !path.starts_with(b"/") {
            return Ok(());
        }
        let absolute = format!(
            "http://{}:{}{}",
            origin_host,
            origin_port,
            String::from_utf8_lossy(&path)
        );
        request.set_path(absolute.as_bytes());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_target_becomes_absolute() {
        let transform = absolute_target_transform("example.com".to_string(), 8080);
        let mut request = Request::new();
        request.set_method("GET");
        request.set_path("/index.html");
        transform(&mut request).unwrap();
        assert_eq!(
            request.path().unwrap().as_ref(),
            b"http://example.com:8080/index.html"
        );
    }

    #[test]
    fn absolute_target_passes_through() {
        let transform = absolute_target_transform("example.com".to_string(), 8080);
        let mut request = Request::new();
        request.set_method("GET");
        request.set_path("http://other.test/x");
        transform(&mut request).unwrap();
        assert_eq!(request.path().unwrap().as_ref(), b"http://other.test/x");
    }

    #[test]
    fn transform_fails_without_a_path() {
        let transform = absolute_target_transform("example.com".to_string(), 8080);
        let mut request = Request::new();
        request.set_method("GET");
        assert_eq!(
            transform(&mut request).unwrap_err(),
            HttpError::DataNotAvailable
        );
    }
}
