use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use serde::Serialize;
use url::Url;

/// Header carrying the shared secret in its raw form.
pub const VERIFY_KEY_HEADER: &str = "x-proxy-verify-key";

/// Upper bound on how much of a rejection body is kept for logs and for the
/// 403 body sent back to the client.
const MAX_REASON_LEN: usize = 512;

/// Credentials extracted from an inbound upgrade request.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub session_id: String,
    pub proxy_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("session_id", &self.session_id)
            .field("proxy_secret", &"***")
            .finish()
    }
}

/// Outcome of a single verification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub ok: bool,
    /// Human-readable failure reason. Always `Some` when `ok` is false.
    pub reason: Option<String>,
    /// HTTP status of the remote response, when one was received.
    pub status: Option<u16>,
}

impl VerificationResult {
    pub fn accepted() -> Self {
        Self {
            ok: true,
            reason: None,
            status: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// The failure reason, or an empty string for accepted results.
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }
}

/// Decides whether an inbound connection may be relayed.
///
/// Implementations must be fail-closed: any condition that prevents a
/// positive answer (missing configuration, transport failure, timeout) is
/// reported as a rejected [`VerificationResult`], never as a pass.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, credentials: &Credentials) -> VerificationResult;
}

/// Settings for [`HttpSessionVerifier`].
#[derive(Clone)]
pub struct VerifierConfig {
    /// Base of the verification API, e.g. `https://base44.app/api`.
    pub api_url: Url,
    pub app_id: Option<String>,
    /// Shared secret presented to the verification endpoint.
    pub verify_key: Option<String>,
    /// Name of the remote function, appended as `/functions/<name>`.
    pub function: String,
    pub timeout: Duration,
}

impl VerifierConfig {
    /// Full endpoint URL, or `None` when no application id is configured.
    pub fn endpoint(&self) -> Option<String> {
        let app_id = self.app_id.as_deref().filter(|id| !id.is_empty())?;
        Some(format!(
            "{}/apps/{}/functions/{}",
            self.api_url.as_str().trim_end_matches('/'),
            app_id,
            self.function
        ))
    }
}

/// Verifies sessions with a single `POST` to a remote verification function.
pub struct HttpSessionVerifier {
    config: VerifierConfig,
    client: reqwest::Client,
}

impl HttpSessionVerifier {
    pub fn new(config: VerifierConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SessionVerifier for HttpSessionVerifier {
    async fn verify(&self, credentials: &Credentials) -> VerificationResult {
        let Some(endpoint) = self.config.endpoint() else {
            return VerificationResult::rejected("verification app id is not configured");
        };
        let Some(key) = self.config.verify_key.as_deref().filter(|k| !k.is_empty()) else {
            return VerificationResult::rejected("verification key is not configured");
        };

        tracing::debug!(
            session_id = %credentials.session_id,
            %endpoint,
            "verifying session"
        );

        // The remote side accepts either the raw header or the bearer form,
        // so both are sent.
        let response = self
            .client
            .post(&endpoint)
            .header(VERIFY_KEY_HEADER, key)
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .json(credentials)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return VerificationResult::rejected(format!(
                    "verification timed out after {}s",
                    self.config.timeout.as_secs_f32()
                ));
            }
            Err(err) => {
                return VerificationResult::rejected(format!(
                    "verification request failed: {err}"
                ));
            }
        };

        let status = response.status();
        if status.is_success() {
            return VerificationResult::accepted().with_status(status.as_u16());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = if body.trim().is_empty() {
            format!("verification failed ({})", status.as_u16())
        } else {
            truncate(body.trim(), MAX_REASON_LEN).to_string()
        };

        VerificationResult::rejected(reason).with_status(status.as_u16())
    }
}

/// Truncates `text` to at most `max` bytes without splitting a UTF-8
/// character.
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
