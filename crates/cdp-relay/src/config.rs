use anyhow::{bail, Context};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use url::Url;

use ws_relay::{ResolverConfig, SessionConfig, UpstreamMode, VerifierConfig};

use crate::cli::Cli;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Full socket address. Takes precedence over `port` when set.
    #[serde(default)]
    pub addr: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            addr: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_function")]
    pub function: String,
    #[serde(default = "default_verify_timeout")]
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            api_url: default_api_url(),
            app_id: None,
            key: None,
            function: default_function(),
            timeout_secs: default_verify_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Extra query pairs, `k=v&k2=v2`.
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            ws_url: default_ws_url(),
            discovery_url: None,
            token: None,
            query: String::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub client_compression: bool,
    #[serde(default)]
    pub upstream_compression: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            keepalive_secs: default_keepalive(),
            client_compression: false,
            upstream_compression: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_port() -> u16 {
    10000
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    "https://base44.app/api".to_string()
}

fn default_function() -> String {
    "verifyBrowserSession".to_string()
}

fn default_verify_timeout() -> u64 {
    5
}

fn default_mode() -> String {
    "static".to_string()
}

fn default_ws_url() -> String {
    "wss://chrome.browserless.io".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_keepalive() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned, so the
/// relay can run from environment variables alone. The caller reports the
/// missing file once logging is up.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    Ok(config)
}

// ---------------------------------------------------------------------------
// Overrides and conversion
// ---------------------------------------------------------------------------

impl Config {
    /// Apply flag and environment overrides on top of the file values.
    pub fn merge_cli(&mut self, cli: &Cli) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set(&mut self.listen.port, &cli.port);
        set_opt(&mut self.listen.addr, &cli.listen);

        set(&mut self.verify.enabled, &cli.verify_enabled);
        set(&mut self.verify.api_url, &cli.verify_api_url);
        set_opt(&mut self.verify.app_id, &cli.verify_app_id);
        set_opt(&mut self.verify.key, &cli.verify_key);
        set(&mut self.verify.function, &cli.verify_function);
        set(&mut self.verify.timeout_secs, &cli.verify_timeout_secs);

        set(&mut self.upstream.mode, &cli.upstream_mode);
        set(&mut self.upstream.ws_url, &cli.upstream_ws_url);
        set_opt(&mut self.upstream.discovery_url, &cli.upstream_discovery_url);
        set_opt(&mut self.upstream.token, &cli.upstream_token);
        set(&mut self.upstream.query, &cli.upstream_query);
        set(
            &mut self.upstream.connect_timeout_secs,
            &cli.upstream_connect_timeout_secs,
        );

        set(&mut self.relay.buffer_capacity, &cli.buffer_capacity);
        set(&mut self.relay.keepalive_secs, &cli.keepalive_secs);
        set(&mut self.relay.client_compression, &cli.client_compression);
        set(&mut self.relay.upstream_compression, &cli.upstream_compression);

        set(&mut self.logging.level, &cli.log_level);

        // Legacy variable names, below their current equivalents.
        if cli.verify_api_url.is_none() {
            set(&mut self.verify.api_url, &cli.legacy_api_url);
        }
        if cli.verify_app_id.is_none() {
            set_opt(&mut self.verify.app_id, &cli.legacy_app_id);
        }
        if cli.upstream_token.is_none() {
            set_opt(&mut self.upstream.token, &cli.legacy_token);
        }
    }

    /// Reject settings the relay cannot run with. Missing secrets are not
    /// errors here; they are reported by [`Config::warnings`].
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.upstream_mode()?;
        Url::parse(&self.verify.api_url)
            .with_context(|| format!("invalid verification API URL {:?}", self.verify.api_url))?;

        if self.relay.client_compression {
            bail!("compression is not supported on the client leg; set client_compression to false");
        }
        if self.relay.upstream_compression {
            bail!("compression is not supported on the upstream leg; set upstream_compression to false");
        }
        Ok(())
    }

    /// Boot-time warnings for features that will degrade at the point of use.
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.verify.enabled {
            if is_blank(&self.verify.app_id) {
                warnings.push("VERIFY_APP_ID is not set; every verification will fail");
            }
            if is_blank(&self.verify.key) {
                warnings.push("PROXY_VERIFY_KEY is not set; every verification will fail");
            }
        }
        if is_blank(&self.upstream.token) {
            warnings.push("UPSTREAM_TOKEN is not set; upstream URLs carry no token");
        }
        warnings
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        match self.listen.addr.as_deref().filter(|a| !a.is_empty()) {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("invalid listen address {addr:?}")),
            None => Ok(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.listen.port,
            )),
        }
    }

    pub fn upstream_mode(&self) -> anyhow::Result<UpstreamMode> {
        match self.upstream.mode.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(UpstreamMode::Static),
            "discovery" => Ok(UpstreamMode::Discovery),
            other => bail!("unknown upstream mode {other:?}; expected static or discovery"),
        }
    }

    pub fn verifier_config(&self) -> anyhow::Result<VerifierConfig> {
        Ok(VerifierConfig {
            api_url: Url::parse(&self.verify.api_url).context("invalid verification API URL")?,
            app_id: self.verify.app_id.clone(),
            verify_key: self.verify.key.clone(),
            function: self.verify.function.clone(),
            timeout: Duration::from_secs(self.verify.timeout_secs),
        })
    }

    pub fn resolver_config(&self) -> anyhow::Result<ResolverConfig> {
        let mode = self.upstream_mode()?;
        let url = match mode {
            UpstreamMode::Static => self.upstream.ws_url.clone(),
            UpstreamMode::Discovery => self.upstream.discovery_url.clone().unwrap_or_default(),
        };
        let extra_query = url::form_urlencoded::parse(self.upstream.query.as_bytes())
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Ok(ResolverConfig {
            mode,
            url,
            token: self.upstream.token.clone().filter(|t| !t.is_empty()),
            extra_query,
            request_timeout: self.connect_timeout(),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        let keepalive_interval =
            (self.relay.keepalive_secs > 0).then(|| Duration::from_secs(self.relay.keepalive_secs));
        SessionConfig {
            buffer_capacity: self.relay.buffer_capacity,
            keepalive_interval,
            ..SessionConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    !value.as_deref().is_some_and(|v| !v.trim().is_empty())
}
