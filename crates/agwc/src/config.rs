use crate::rpc::ClientOptions;
use crate::supervisor::SupervisorConfig;
use agw_common::types::{client_id, client_mode, role, scope};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the gateway host.
#[derive(Parser)]
#[command(name = "agwc", about = "Agent gateway supervisor and RPC client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Gateway WebSocket URL override.
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Gateway token override.
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Supervise the gateway process and hold an RPC session to it.
    Run {
        /// Only connect to an already running gateway.
        #[arg(long)]
        no_spawn: bool,
    },
    /// Send one request to the gateway and print the response payload.
    Call {
        /// Method name, e.g. `health`.
        method: String,
        /// Request parameters as a JSON document.
        #[arg(long)]
        params: Option<String>,
        /// Request timeout in milliseconds; defaults to `client.request_timeout_ms`.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Wait past an `accepted` acknowledgement for the final response.
        #[arg(long)]
        expect_final: bool,
    },
    /// Print the device id and public key, creating the identity if needed.
    Identity,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    /// Gateway process settings.
    pub gateway: GatewayConfig,
    /// RPC client settings.
    pub client: ClientConfig,
}

/// How the gateway process is launched and restarted.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Program to execute.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Gateway config file handed to the child.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Gateway state directory handed to the child.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Env var carrying `config_path`.
    pub config_path_env: String,
    /// Env var carrying `state_dir`.
    pub state_dir_env: String,
    /// First restart delay, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Largest restart delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Uptime after which a run counts as healthy, in milliseconds.
    pub healthy_threshold_ms: u64,
    /// SIGTERM to SIGKILL grace, in milliseconds.
    pub stop_grace_ms: u64,
    /// Consecutive restarts allowed before giving up.
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: "openclaw".to_string(),
            args: vec!["gateway".to_string()],
            config_path: None,
            state_dir: None,
            config_path_env: "OPENCLAW_CONFIG_PATH".to_string(),
            state_dir_env: "OPENCLAW_STATE_DIR".to_string(),
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            healthy_threshold_ms: 60_000,
            stop_grace_ms: 5000,
            max_restarts: None,
        }
    }
}

/// How the RPC client reaches and authenticates to the gateway.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the gateway.
    pub url: String,
    /// Pre-shared gateway token.
    #[serde(default)]
    pub token: Option<String>,
    /// Gateway password.
    #[serde(default)]
    pub password: Option<String>,
    /// Client identifier sent in the handshake.
    pub client_id: String,
    /// Client mode sent in the handshake.
    pub mode: String,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Default request timeout, in milliseconds.
    pub request_timeout_ms: u64,
    /// Timeout for the handshake's `connect` request, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Time allowed for `connect.challenge`, in milliseconds.
    pub challenge_timeout_ms: u64,
    /// Reconnect after the socket closes.
    pub auto_reconnect: bool,
    /// First reconnect delay, in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Largest reconnect delay, in milliseconds.
    pub reconnect_max_ms: u64,
    /// Sign the handshake with the local device identity.
    pub device_auth: bool,
    /// Device identity file; defaults to `<config dir>/agwc/identity/device.json`.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            password: None,
            client_id: client_id::GATEWAY_CLIENT.to_string(),
            mode: client_mode::BACKEND.to_string(),
            role: role::OPERATOR.to_string(),
            scopes: vec![
                scope::ADMIN.to_string(),
                scope::APPROVALS.to_string(),
                scope::PAIRING.to_string(),
            ],
            request_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            challenge_timeout_ms: 10_000,
            auto_reconnect: true,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            device_auth: true,
            identity_path: None,
        }
    }
}

impl HostConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        let gw = &self.gateway;
        if gw.command.trim().is_empty() {
            return Err("gateway.command must not be empty".to_string());
        }
        if gw.config_path_env.is_empty() || gw.state_dir_env.is_empty() {
            return Err("gateway env var names must not be empty".to_string());
        }
        if gw.initial_backoff_ms == 0 {
            return Err("gateway.initial_backoff_ms must be greater than 0".to_string());
        }
        if gw.max_backoff_ms < gw.initial_backoff_ms {
            return Err("gateway.max_backoff_ms must be >= initial_backoff_ms".to_string());
        }

        let client = &self.client;
        if !(client.url.starts_with("ws://") || client.url.starts_with("wss://")) {
            return Err(format!(
                "client.url must start with ws:// or wss://, got: {}",
                client.url
            ));
        }
        if client.request_timeout_ms == 0 {
            return Err("client.request_timeout_ms must be greater than 0".to_string());
        }
        if client.connect_timeout_ms == 0 {
            return Err("client.connect_timeout_ms must be greater than 0".to_string());
        }
        if client.challenge_timeout_ms == 0 {
            return Err("client.challenge_timeout_ms must be greater than 0".to_string());
        }
        if client.reconnect_initial_ms == 0 {
            return Err("client.reconnect_initial_ms must be greater than 0".to_string());
        }
        if client.reconnect_max_ms < client.reconnect_initial_ms {
            return Err("client.reconnect_max_ms must be >= reconnect_initial_ms".to_string());
        }
        if client.token.as_deref().is_some_and(str::is_empty) {
            return Err("client.token must not be empty when set".to_string());
        }

        Ok(())
    }

    /// Supervisor settings derived from the `[gateway]` table.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let gw = &self.gateway;
        let mut config = SupervisorConfig::new(gw.command.clone(), gw.args.clone());
        config.config_path = gw.config_path.clone();
        config.state_dir = gw.state_dir.clone();
        config.config_path_env = gw.config_path_env.clone();
        config.state_dir_env = gw.state_dir_env.clone();
        config.initial_backoff = Duration::from_millis(gw.initial_backoff_ms);
        config.max_backoff = Duration::from_millis(gw.max_backoff_ms);
        config.healthy_threshold = Duration::from_millis(gw.healthy_threshold_ms);
        config.stop_grace = Duration::from_millis(gw.stop_grace_ms);
        config.max_restarts = gw.max_restarts;
        config
    }

    /// RPC client options derived from the `[client]` table.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        let c = &self.client;
        let mut opts = ClientOptions::new(c.url.clone());
        opts.token = c.token.clone();
        opts.password = c.password.clone();
        opts.client_id = c.client_id.clone();
        opts.mode = c.mode.clone();
        opts.role = c.role.clone();
        opts.scopes = c.scopes.clone();
        opts.request_timeout = Duration::from_millis(c.request_timeout_ms);
        opts.connect_timeout = Duration::from_millis(c.connect_timeout_ms);
        opts.challenge_timeout = Duration::from_millis(c.challenge_timeout_ms);
        opts.auto_reconnect = c.auto_reconnect;
        opts.reconnect_base = Duration::from_millis(c.reconnect_initial_ms);
        opts.reconnect_max = Duration::from_millis(c.reconnect_max_ms);
        opts
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    let defaults = HostConfig::default();
    let gw = &defaults.gateway;
    let client = &defaults.client;
    let mut builder = config::Config::builder()
        .set_default("gateway.command", gw.command.as_str())?
        .set_default("gateway.args", gw.args.clone())?
        .set_default("gateway.config_path_env", gw.config_path_env.as_str())?
        .set_default("gateway.state_dir_env", gw.state_dir_env.as_str())?
        .set_default("gateway.initial_backoff_ms", gw.initial_backoff_ms as i64)?
        .set_default("gateway.max_backoff_ms", gw.max_backoff_ms as i64)?
        .set_default(
            "gateway.healthy_threshold_ms",
            gw.healthy_threshold_ms as i64,
        )?
        .set_default("gateway.stop_grace_ms", gw.stop_grace_ms as i64)?
        .set_default("client.url", client.url.as_str())?
        .set_default("client.client_id", client.client_id.as_str())?
        .set_default("client.mode", client.mode.as_str())?
        .set_default("client.role", client.role.as_str())?
        .set_default("client.scopes", client.scopes.clone())?
        .set_default("client.request_timeout_ms", client.request_timeout_ms as i64)?
        .set_default("client.connect_timeout_ms", client.connect_timeout_ms as i64)?
        .set_default(
            "client.challenge_timeout_ms",
            client.challenge_timeout_ms as i64,
        )?
        .set_default("client.auto_reconnect", client.auto_reconnect)?
        .set_default(
            "client.reconnect_initial_ms",
            client.reconnect_initial_ms as i64,
        )?
        .set_default("client.reconnect_max_ms", client.reconnect_max_ms as i64)?
        .set_default("client.device_auth", client.device_auth)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else if let Some(config_path) = resolve_data_path("config.toml").filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(config_path));
    }

    // AGWC_CLIENT__TOKEN -> client.token; field names keep their underscores.
    builder = builder.add_source(
        config::Environment::with_prefix("AGWC")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: HostConfig = settings.try_deserialize()?;

    Ok(config)
}

/// Resolve path for agwc data files (config.toml, identity, etc.).
/// Checks platform-native config dir first, then falls back to ~/.config/agwc/.
#[must_use]
pub fn resolve_data_path(filename: &str) -> Option<PathBuf> {
    let native = dirs::config_dir().map(|d| d.join("agwc").join(filename));
    let xdg = dirs::home_dir().map(|d| d.join(".config").join("agwc").join(filename));

    if let Some(p) = native.as_ref().filter(|p| p.exists()) {
        return Some(p.clone());
    }
    if let Some(p) = xdg.as_ref().filter(|p| p.exists()) {
        return Some(p.clone());
    }
    native.or(xdg)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;

    fn get_test_path() -> PathBuf {
        let random_suffix: u64 = rand::random();
        std::env::temp_dir().join(format!("agwc_config_test_{random_suffix}"))
    }

    #[test]
    fn test_default_config_has_expected_values() {
        let config = HostConfig::default();

        assert_eq!(config.gateway.command, "openclaw");
        assert_eq!(config.gateway.args, vec!["gateway".to_string()]);
        assert_eq!(config.client.url, "ws://127.0.0.1:18789");
        assert!(config.client.token.is_none());
    }

    #[test]
    fn test_load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")))
            .expect("load_config should succeed with no file");

        assert_eq!(config.gateway.command, "openclaw");
        assert_eq!(config.gateway.initial_backoff_ms, 1000);
        assert_eq!(config.client.url, "ws://127.0.0.1:18789");
        assert_eq!(config.client.scopes.len(), 3);
        assert!(config.gateway.max_restarts.is_none());
    }

    #[test]
    fn test_load_config_reads_toml_file() {
        let dir = get_test_path();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
command = "/usr/local/bin/openclaw"
args = ["gateway", "--port", "19000"]
max_restarts = 5
state_dir = "/var/lib/openclaw"

[client]
url = "ws://127.0.0.1:19000"
token = "secret"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.gateway.command, "/usr/local/bin/openclaw");
        assert_eq!(config.gateway.args.len(), 3);
        assert_eq!(config.gateway.max_restarts, Some(5));
        assert_eq!(
            config.gateway.state_dir,
            Some(PathBuf::from("/var/lib/openclaw"))
        );
        assert_eq!(config.client.token.as_deref(), Some("secret"));
        assert_eq!(config.client.reconnect_max_ms, 30_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_default_config_passes_validation() {
        assert!(HostConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_invalid_url_scheme() {
        let mut config = HostConfig::default();
        config.client.url = "http://127.0.0.1:18789".to_string();
        assert!(config.validate().unwrap_err().contains("ws://"));
    }

    #[test]
    fn test_validate_accepts_wss_url() {
        let mut config = HostConfig::default();
        config.client.url = "wss://gateway.example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config = HostConfig::default();
        config.gateway.command = "  ".to_string();
        assert!(config.validate().unwrap_err().contains("gateway.command"));
    }

    #[test]
    fn test_validate_rejects_max_backoff_less_than_initial() {
        let mut config = HostConfig::default();
        config.gateway.initial_backoff_ms = 1000;
        config.gateway.max_backoff_ms = 500;
        assert!(config.validate().unwrap_err().contains("max_backoff_ms"));
    }

    #[test]
    fn test_validate_rejects_zero_request_timeout() {
        let mut config = HostConfig::default();
        config.client.request_timeout_ms = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .contains("request_timeout_ms"));
    }

    #[test]
    fn test_validate_rejects_empty_token() {
        let mut config = HostConfig::default();
        config.client.token = Some(String::new());
        assert!(config.validate().unwrap_err().contains("client.token"));
    }

    #[test]
    fn test_supervisor_config_carries_timings() {
        let mut config = HostConfig::default();
        config.gateway.stop_grace_ms = 250;
        config.gateway.max_restarts = Some(3);
        let sup = config.supervisor_config();
        assert_eq!(sup.command, "openclaw");
        assert_eq!(sup.initial_backoff, Duration::from_secs(1));
        assert_eq!(sup.max_backoff, Duration::from_secs(30));
        assert_eq!(sup.healthy_threshold, Duration::from_secs(60));
        assert_eq!(sup.stop_grace, Duration::from_millis(250));
        assert_eq!(sup.max_restarts, Some(3));
        assert_eq!(sup.config_path_env, "OPENCLAW_CONFIG_PATH");
    }

    #[test]
    fn test_client_options_carry_auth_and_timings() {
        let mut config = HostConfig::default();
        config.client.token = Some("tok".to_string());
        config.client.challenge_timeout_ms = 2500;
        config.client.request_timeout_ms = 4500;
        config.client.connect_timeout_ms = 7000;
        let opts = config.client_options();
        assert_eq!(opts.url, "ws://127.0.0.1:18789");
        assert_eq!(opts.token.as_deref(), Some("tok"));
        assert_eq!(opts.challenge_timeout, Duration::from_millis(2500));
        assert_eq!(opts.request_timeout, Duration::from_millis(4500));
        assert_eq!(opts.connect_timeout, Duration::from_millis(7000));
        assert_eq!(opts.reconnect_base, Duration::from_secs(1));
        assert_eq!(opts.role, "operator");
    }
}
