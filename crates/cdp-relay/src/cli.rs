use clap::Parser;
use std::path::PathBuf;

/// Every setting can come from a flag or its environment variable. Both
/// take precedence over the configuration file.
#[derive(Parser, Debug, Default)]
#[command(
    name = "cdp-relay",
    version,
    about = "Session-verified WebSocket relay for browser automation backends"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "relay.yaml")]
    pub config: PathBuf,

    /// Port to listen on (binds 0.0.0.0)
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Full listen address; overrides --port
    #[arg(long, env = "RELAY_LISTEN")]
    pub listen: Option<String>,

    /// Base URL of the verification API
    #[arg(long, env = "VERIFY_API_URL")]
    pub verify_api_url: Option<String>,

    /// Application identifier used in the verification URL
    #[arg(long, env = "VERIFY_APP_ID")]
    pub verify_app_id: Option<String>,

    /// Shared secret presented to the verification endpoint
    #[arg(long, env = "PROXY_VERIFY_KEY", hide_env_values = true)]
    pub verify_key: Option<String>,

    /// Name of the remote verification function
    #[arg(long, env = "VERIFY_FUNCTION")]
    pub verify_function: Option<String>,

    /// Verify credentials against the remote endpoint (true/false)
    #[arg(long, env = "RELAY_VERIFY_ENABLED")]
    pub verify_enabled: Option<bool>,

    /// Verification timeout in seconds
    #[arg(long, env = "VERIFY_TIMEOUT_SECS")]
    pub verify_timeout_secs: Option<u64>,

    /// How the upstream target is obtained: static or discovery
    #[arg(long, env = "UPSTREAM_MODE")]
    pub upstream_mode: Option<String>,

    /// Upstream WebSocket URL (static mode)
    #[arg(long, env = "UPSTREAM_WS_URL")]
    pub upstream_ws_url: Option<String>,

    /// Backend base URL (discovery mode)
    #[arg(long, env = "UPSTREAM_DISCOVERY_URL")]
    pub upstream_discovery_url: Option<String>,

    /// Access token appended to upstream URLs as `token=`
    #[arg(long, env = "UPSTREAM_TOKEN", hide_env_values = true)]
    pub upstream_token: Option<String>,

    /// Extra query pairs appended to the static upstream URL (`k=v&k2=v2`)
    #[arg(long, env = "UPSTREAM_QUERY")]
    pub upstream_query: Option<String>,

    /// Upstream resolve + connect timeout in seconds
    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT_SECS")]
    pub upstream_connect_timeout_secs: Option<u64>,

    /// Client frames buffered while the upstream dial is in flight
    #[arg(long, env = "RELAY_BUFFER_CAPACITY")]
    pub buffer_capacity: Option<usize>,

    /// Upstream keepalive ping interval in seconds (0 disables)
    #[arg(long, env = "RELAY_KEEPALIVE_SECS")]
    pub keepalive_secs: Option<u64>,

    /// Enable permessage-deflate on the client leg
    #[arg(long, env = "RELAY_CLIENT_COMPRESSION")]
    pub client_compression: Option<bool>,

    /// Enable permessage-deflate on the upstream leg
    #[arg(long, env = "RELAY_UPSTREAM_COMPRESSION")]
    pub upstream_compression: Option<bool>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    // Names used by earlier deployments. Each applies only when the setting
    // above is not given.
    #[arg(long = "base44-api-url", env = "BASE44_API_URL", hide = true)]
    pub legacy_api_url: Option<String>,

    #[arg(long = "base44-app-id", env = "BASE44_APP_ID", hide = true)]
    pub legacy_app_id: Option<String>,

    #[arg(
        long = "browserless-token",
        env = "BROWSERLESS_TOKEN",
        hide = true,
        hide_env_values = true
    )]
    pub legacy_token: Option<String>,
}
