use std::fmt;
use std::time::Duration;

use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Query parameter used to pass the access token to the backend.
pub const TOKEN_PARAM: &str = "token";

/// Path of the CDP version-metadata endpoint, relative to the backend base.
pub const VERSION_PATH: &str = "json/version";

/// WebSocket stream to the automation backend.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors produced while computing the upstream dial target.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream URL is not configured")]
    MissingUrl,

    #[error("invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported upstream scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("discovery request failed: {0}")]
    DiscoveryRequest(reqwest::Error),

    #[error("discovery returned status {status}")]
    DiscoveryStatus { status: u16 },

    #[error("malformed discovery response: {0}")]
    DiscoveryPayload(reqwest::Error),

    #[error("discovery response has no webSocketDebuggerUrl")]
    MissingDebuggerUrl,
}

/// Errors produced while dialing the upstream WebSocket.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("upstream resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("invalid upstream request: {0}")]
    Request(String),

    #[error("upstream handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("upstream connect timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// How the dial target is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    /// Use the configured WebSocket URL directly.
    Static,
    /// Ask the backend's `/json/version` endpoint for the debugger URL.
    Discovery,
}

/// Settings for [`UpstreamResolver`].
#[derive(Clone)]
pub struct ResolverConfig {
    pub mode: UpstreamMode,
    /// WebSocket URL in static mode, backend base URL in discovery mode.
    /// Parsed lazily so a bad value fails the session, not the process.
    pub url: String,
    pub token: Option<String>,
    /// Extra query pairs appended in static mode when their key is absent.
    pub extra_query: Vec<(String, String)>,
    /// Timeout for the discovery HTTP call.
    pub request_timeout: Duration,
}

/// A resolved dial destination.
///
/// `Display` and `Debug` render the URL with the token value redacted, so a
/// target can be logged directly.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    url: Url,
    subprotocols: Vec<String>,
}

impl UpstreamTarget {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            subprotocols: Vec::new(),
        }
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    /// The URL with every `token` value replaced by `***`.
    pub fn redacted(&self) -> String {
        redact(&self.url)
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamTarget")
            .field("url", &self.redacted())
            .field("subprotocols", &self.subprotocols)
            .finish()
    }
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// Produces the upstream dial target for each new session.
pub struct UpstreamResolver {
    config: ResolverConfig,
    client: reqwest::Client,
}

impl UpstreamResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    /// Resolve the dial target. Static mode is pure; discovery mode makes one
    /// HTTP round-trip.
    pub async fn resolve(&self) -> Result<UpstreamTarget, ResolveError> {
        match self.config.mode {
            UpstreamMode::Static => self.resolve_static(),
            UpstreamMode::Discovery => self.discover().await,
        }
    }

    fn resolve_static(&self) -> Result<UpstreamTarget, ResolveError> {
        let mut url = self.configured_url()?;

        match url.scheme() {
            "ws" | "wss" => {}
            "http" => set_scheme(&mut url, "ws")?,
            "https" => set_scheme(&mut url, "wss")?,
            other => return Err(ResolveError::UnsupportedScheme(other.to_string())),
        }
        if url.path().is_empty() {
            url.set_path("/");
        }
        if let Some(token) = self.token() {
            append_if_absent(&mut url, TOKEN_PARAM, token);
        }
        for (key, value) in &self.config.extra_query {
            append_if_absent(&mut url, key, value);
        }

        Ok(UpstreamTarget::new(url))
    }

    async fn discover(&self) -> Result<UpstreamTarget, ResolveError> {
        let mut endpoint = self.configured_url()?;

        match endpoint.scheme() {
            "http" | "https" => {}
            "ws" => set_scheme(&mut endpoint, "http")?,
            "wss" => set_scheme(&mut endpoint, "https")?,
            other => return Err(ResolveError::UnsupportedScheme(other.to_string())),
        }
        let path = format!("{}/{VERSION_PATH}", endpoint.path().trim_end_matches('/'));
        endpoint.set_path(&path);
        endpoint.set_query(None);
        if let Some(token) = self.token() {
            endpoint.query_pairs_mut().append_pair(TOKEN_PARAM, token);
        }

        tracing::debug!(endpoint = %redact(&endpoint), "querying CDP version metadata");

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(ResolveError::DiscoveryRequest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::DiscoveryStatus {
                status: status.as_u16(),
            });
        }

        let info: VersionInfo = response
            .json()
            .await
            .map_err(ResolveError::DiscoveryPayload)?;
        let raw = info
            .web_socket_debugger_url
            .filter(|u| !u.is_empty())
            .ok_or(ResolveError::MissingDebuggerUrl)?;

        let mut url = Url::parse(&raw)?;
        match url.scheme() {
            "ws" | "http" | "https" => set_scheme(&mut url, "wss")?,
            "wss" => {}
            other => return Err(ResolveError::UnsupportedScheme(other.to_string())),
        }
        if let Some(token) = self.token() {
            append_if_absent(&mut url, TOKEN_PARAM, token);
        }

        Ok(UpstreamTarget::new(url))
    }

    fn configured_url(&self) -> Result<Url, ResolveError> {
        let raw = self.config.url.trim();
        if raw.is_empty() {
            return Err(ResolveError::MissingUrl);
        }
        Ok(Url::parse(raw)?)
    }

    fn token(&self) -> Option<&str> {
        self.config.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Resolve the target and open the upstream WebSocket.
///
/// The whole sequence, discovery included, is bounded by `timeout`. No
/// compression extension is offered.
pub async fn connect(
    resolver: &UpstreamResolver,
    subprotocols: Vec<String>,
    timeout: Duration,
) -> Result<UpstreamStream, DialError> {
    let attempt = async {
        let target = resolver.resolve().await?.with_subprotocols(subprotocols);
        tracing::debug!(upstream = %target, "dialing upstream");

        let mut request = target
            .url()
            .as_str()
            .into_client_request()
            .map_err(|err| DialError::Request(err.to_string()))?;
        if !target.subprotocols().is_empty() {
            let value = HeaderValue::from_str(&target.subprotocols().join(", "))
                .map_err(|err| DialError::Request(err.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) =
            tokio_tungstenite::connect_async_with_config(request, None, true).await?;
        Ok::<_, DialError>(stream)
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| DialError::TimedOut(timeout))?
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<(), ResolveError> {
    url.set_scheme(scheme)
        .map_err(|()| ResolveError::UnsupportedScheme(url.scheme().to_string()))
}

fn append_if_absent(url: &mut Url, key: &str, value: &str) {
    if !url.query_pairs().any(|(k, _)| k == key) {
        url.query_pairs_mut().append_pair(key, value);
    }
}

/// Render `url` with every `token` query value replaced by `***`.
pub fn redact(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == TOKEN_PARAM) {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == TOKEN_PARAM { "***".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();

    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
