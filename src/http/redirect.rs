//! HTTP to HTTPS redirect listener.
//!
//! Runs next to the TLS listener when `redirect_http` is set, on the same
//! interface and the configured plain port. It has its own [`Handle`], which
//! the stop task shuts down together with the main one.

use std::net::{IpAddr, SocketAddr};

use axum::http::uri::Authority;
use axum::http::Uri;
use axum::response::Redirect;
use axum::routing::any;
use axum::Router;
use axum_extra::extract::Host;
use axum_server::Handle;

/// Spawn the redirect listener. Failures are logged; they never affect the
/// main listener.
pub fn spawn_redirect_server(ip: IpAddr, http_port: u16, https_port: u16, handle: Handle) {
    tokio::spawn(async move {
        let addr = SocketAddr::new(ip, http_port);

        tracing::info!(%addr, https_port, "Starting HTTP->HTTPS redirect server");

        let app = Router::new().fallback(any(move |Host(host): Host, uri: Uri| async move {
            redirect_to_https(&host, &uri, https_port)
        }));

        if let Err(e) = axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
        {
            tracing::error!(error = %e, %addr, "HTTP redirect server failed");
            return;
        }
        tracing::debug!("HTTP redirect server stopped");
    });
}

fn redirect_to_https(host: &str, uri: &Uri, https_port: u16) -> Redirect {
    let location = https_url(host, uri, https_port);
    tracing::debug!(from = %uri, to = %location, "Redirecting HTTP to HTTPS");
    Redirect::permanent(&location)
}

/// Same host and path on the HTTPS port. The port is left out when it is 443.
fn https_url(host: &str, uri: &Uri, https_port: u16) -> String {
    let host = host
        .parse::<Authority>()
        .map(|authority| authority.host().to_string())
        .unwrap_or_else(|_| host.to_string());
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    match https_port {
        443 => format!("https://{host}{path}"),
        port => format!("https://{host}:{port}{path}"),
    }
}
