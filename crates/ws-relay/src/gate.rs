use std::sync::Arc;

use http::{HeaderMap, StatusCode, Uri};
use thiserror::Error;

use crate::verifier::{Credentials, SessionVerifier};

/// Query parameter carrying the session identifier.
pub const SESSION_ID_PARAM: &str = "sessionId";
/// Query parameter carrying the per-session proxy secret.
pub const PROXY_SECRET_PARAM: &str = "proxySecret";
/// Fallback header for intermediaries that strip query strings on upgrade.
pub const SESSION_ID_HEADER: &str = "x-session-id";
/// Fallback header for the proxy secret.
pub const PROXY_SECRET_HEADER: &str = "x-proxy-secret";

/// Why an upgrade request was refused before the handshake completed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("Missing sessionId/proxySecret")]
    MissingCredentials,
    #[error("{0}")]
    Unverified(String),
    #[error("Upgrade error")]
    Internal(String),
}

impl GateRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredentials => StatusCode::BAD_REQUEST,
            Self::Unverified(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text body sent with the rejection. Internal details stay in
    /// the logs.
    pub fn body(&self) -> String {
        self.to_string()
    }
}

/// Authenticates upgrade requests before the WebSocket handshake finishes.
pub struct ConnectionGate {
    verifier: Arc<dyn SessionVerifier>,
    verify_enabled: bool,
}

impl ConnectionGate {
    /// Create a gate. With `verify_enabled == false` credentials must
    /// still be present, but the verifier is never called.
    pub fn new(verifier: Arc<dyn SessionVerifier>, verify_enabled: bool) -> Self {
        Self {
            verifier,
            verify_enabled,
        }
    }

    /// Run the gate for one upgrade request.
    ///
    /// Exactly one verification attempt is made per call. The verifier runs
    /// on its own task so a panicking implementation surfaces as
    /// [`GateRejection::Internal`] instead of tearing down the connection
    /// task.
    pub async fn admit(&self, uri: &Uri, headers: &HeaderMap) -> Result<Credentials, GateRejection> {
        let credentials = extract_credentials(uri, headers).ok_or(GateRejection::MissingCredentials)?;

        if !self.verify_enabled {
            tracing::debug!(session_id = %credentials.session_id, "verification disabled; admitting");
            return Ok(credentials);
        }

        let verifier = Arc::clone(&self.verifier);
        let attempt = credentials.clone();
        let result = tokio::spawn(async move { verifier.verify(&attempt).await })
            .await
            .map_err(|err| GateRejection::Internal(err.to_string()))?;

        if result.ok {
            Ok(credentials)
        } else {
            Err(GateRejection::Unverified(result.reason().to_string()))
        }
    }
}

/// Pull `sessionId` and `proxySecret` from the query string, falling back to
/// the `x-session-id` / `x-proxy-secret` headers. Empty values count as
/// missing.
pub fn extract_credentials(uri: &Uri, headers: &HeaderMap) -> Option<Credentials> {
    let mut session_id = None;
    let mut proxy_secret = None;

    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match &*key {
                SESSION_ID_PARAM if session_id.is_none() => session_id = Some(value.into_owned()),
                PROXY_SECRET_PARAM if proxy_secret.is_none() => {
                    proxy_secret = Some(value.into_owned())
                }
                _ => {}
            }
        }
    }

    let session_id = session_id.or_else(|| header_value(headers, SESSION_ID_HEADER))?;
    let proxy_secret = proxy_secret.or_else(|| header_value(headers, PROXY_SECRET_HEADER))?;

    Some(Credentials {
        session_id,
        proxy_secret,
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
