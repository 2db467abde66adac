use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::gate::{ConnectionGate, GateRejection};
use crate::relay::{RelaySession, SessionConfig};
use crate::upstream::{self, UpstreamResolver};
use crate::verifier::SessionVerifier;

type Body = Full<Bytes>;

/// Configuration for the relay listener.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// When false, credentials must be present but are not verified.
    pub verify_enabled: bool,
    /// Per-session buffering, keepalive and close settings.
    pub session: SessionConfig,
    /// Bound on upstream resolution plus WebSocket dial.
    pub upstream_connect_timeout: Duration,
}

/// The relay server.
///
/// Serves plain HTTP health checks and WebSocket upgrades on one port. Each
/// upgrade is authenticated by the [`ConnectionGate`] before the handshake
/// completes, then handed to its own [`RelaySession`] task.
pub struct Proxy {
    shared: Arc<Shared>,
}

struct Shared {
    config: ProxyConfig,
    gate: ConnectionGate,
    resolver: UpstreamResolver,
}

impl Proxy {
    /// Create a new relay server. Nothing is bound until [`run`](Self::run)
    /// or [`serve`](Self::serve) is called.
    pub fn new(
        config: ProxyConfig,
        verifier: Arc<dyn SessionVerifier>,
        resolver: UpstreamResolver,
    ) -> Self {
        let gate = ConnectionGate::new(verifier, config.verify_enabled);
        Self {
            shared: Arc::new(Shared {
                config,
                gate,
                resolver,
            }),
        }
    }

    /// Bind to `listen_addr` and serve forever.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener. Each connection is
    /// handled in its own Tokio task.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "relay listening");

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);

            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, remote_addr, shared).await {
                    tracing::debug!(%remote_addr, %err, "connection ended with error");
                }
            });
        }
    }
}

/// Serve one TCP connection as HTTP/1.1 with upgrades enabled.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), hyper::Error> {
    let service = service_fn(move |req| {
        let shared = Arc::clone(&shared);
        async move { Ok::<_, Infallible>(route(req, remote_addr, shared).await) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
}

async fn route(req: Request<Incoming>, remote_addr: SocketAddr, shared: Arc<Shared>) -> Response<Body> {
    if is_websocket_upgrade(&req) {
        upgrade(req, remote_addr, shared).await
    } else {
        health()
    }
}

fn health() -> Response<Body> {
    plain(StatusCode::OK, "ok")
}

/// Gate the upgrade request and, on success, answer `101` and spawn the
/// relay session on the upgraded connection.
async fn upgrade(
    mut req: Request<Incoming>,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Response<Body> {
    let key = match handshake_key(req.headers()) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let session_id = uuid::Uuid::new_v4();
    tracing::info!(
        %session_id,
        %remote_addr,
        path = req.uri().path(),
        "upgrade requested"
    );

    let credentials = match shared.gate.admit(req.uri(), req.headers()).await {
        Ok(credentials) => credentials,
        Err(rejection) => {
            log_rejection(session_id, remote_addr, &rejection);
            return reject(&rejection);
        }
    };

    let offered = offered_subprotocols(req.headers());
    let response = match switching_protocols(&key, offered.first().map(String::as_str)) {
        Ok(response) => response,
        Err(err) => {
            let rejection = GateRejection::Internal(err.to_string());
            log_rejection(session_id, remote_addr, &rejection);
            return reject(&rejection);
        }
    };

    tracing::info!(
        %session_id,
        %remote_addr,
        client_session = %credentials.session_id,
        "upgrade accepted"
    );

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(run_session(on_upgrade, session_id, remote_addr, offered, shared));

    response
}

/// Drive one relay session on an upgraded connection.
async fn run_session(
    on_upgrade: OnUpgrade,
    session_id: uuid::Uuid,
    remote_addr: SocketAddr,
    subprotocols: Vec<String>,
    shared: Arc<Shared>,
) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(err) => {
            tracing::warn!(%session_id, %remote_addr, %err, "upgrade did not complete");
            return;
        }
    };

    let client =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    let timeout = shared.config.upstream_connect_timeout;
    let session_config = shared.config.session.clone();
    let dial = async move { upstream::connect(&shared.resolver, subprotocols, timeout).await };

    let cause = RelaySession::new(session_id, client, dial, session_config)
        .run()
        .await;

    tracing::info!(%session_id, %remote_addr, %cause, "connection closed");
}

fn log_rejection(session_id: uuid::Uuid, remote_addr: SocketAddr, rejection: &GateRejection) {
    match rejection {
        GateRejection::MissingCredentials => {
            tracing::info!(%session_id, %remote_addr, "upgrade rejected: missing credentials");
        }
        GateRejection::Unverified(reason) => {
            tracing::warn!(%session_id, %remote_addr, %reason, "upgrade rejected: verification failed");
        }
        GateRejection::Internal(detail) => {
            tracing::error!(%session_id, %remote_addr, %detail, "upgrade failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake helpers
// ---------------------------------------------------------------------------

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET
        && header_has_token(req.headers(), CONNECTION.as_str(), "upgrade")
        && req
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Validate the version and return the client's `Sec-WebSocket-Key`.
fn handshake_key(headers: &HeaderMap) -> Result<String, Response<Body>> {
    let version = headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if version != Some("13") {
        let mut response = plain(StatusCode::BAD_REQUEST, "Unsupported WebSocket version");
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        return Err(response);
    }

    headers
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            let mut response = plain(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
            response
        })
}

/// Subprotocols offered by the client, in preference order.
fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the `101` response. No extensions are negotiated.
fn switching_protocols(key: &str, protocol: Option<&str>) -> Result<Response<Body>, http::Error> {
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    builder.body(Full::new(Bytes::new()))
}

fn reject(rejection: &GateRejection) -> Response<Body> {
    let mut response = plain(rejection.status(), rejection.body());
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request() -> http::request::Builder {
        Request::builder()
            .method(Method::GET)
            .uri("/?sessionId=abc&proxySecret=xyz")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[test]
    fn detects_upgrade_requests() {
        let req = upgrade_request().body(()).unwrap();
        assert!(is_websocket_upgrade(&req));

        let plain_get = Request::builder().uri("/health").body(()).unwrap();
        assert!(!is_websocket_upgrade(&plain_get));

        let post = upgrade_request().method(Method::POST).body(()).unwrap();
        assert!(!is_websocket_upgrade(&post));
    }

    #[test]
    fn handshake_requires_version_13() {
        let headers = upgrade_request().body(()).unwrap().headers().clone();
        assert_eq!(handshake_key(&headers).unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");

        let mut headers = upgrade_request().body(()).unwrap().headers().clone();
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        let response = handshake_key(&headers).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[SEC_WEBSOCKET_VERSION], "13");
    }

    #[test]
    fn handshake_requires_key() {
        let mut headers = upgrade_request().body(()).unwrap().headers().clone();
        headers.remove(SEC_WEBSOCKET_KEY);
        let response = handshake_key(&headers).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        let response = switching_protocols("dGhlIHNhbXBsZSBub25jZQ==", None).unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers()[SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
        assert!(response.headers().get("sec-websocket-extensions").is_none());
    }

    #[test]
    fn first_offered_subprotocol_is_selected() {
        let req = upgrade_request()
            .header(SEC_WEBSOCKET_PROTOCOL, "cdp, v2")
            .header(SEC_WEBSOCKET_PROTOCOL, "v3")
            .body(())
            .unwrap();
        let offered = offered_subprotocols(req.headers());
        assert_eq!(offered, vec!["cdp", "v2", "v3"]);

        let response = switching_protocols("dGhlIHNhbXBsZSBub25jZQ==", Some(&offered[0])).unwrap();
        assert_eq!(response.headers()[SEC_WEBSOCKET_PROTOCOL], "cdp");
    }

    #[test]
    fn rejections_close_the_connection() {
        let response = reject(&GateRejection::Unverified("expired".to_string()));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CONNECTION], "close");
    }
}
