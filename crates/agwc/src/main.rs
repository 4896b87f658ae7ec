#![forbid(unsafe_code)]

use agwc::config::{load_config, resolve_data_path, Cli, Commands, HostConfig};
use agwc::identity::{DeviceIdentity, IdentityCache};
use agwc::rpc::{ClientNotice, RequestOptions, RpcClient};
use agwc::supervisor::{Supervisor, SupervisorEvent};

use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";

// ── Shared helpers ──────────────────────────────────────────────────

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

fn load_host_config(cli: &Cli) -> anyhow::Result<HostConfig> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref url) = cli.url {
        config.client.url = url.clone();
    }
    if let Some(ref token) = cli.token {
        config.client.token = Some(token.clone());
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

fn identity_path(config: &HostConfig) -> anyhow::Result<PathBuf> {
    config
        .client
        .identity_path
        .clone()
        .or_else(|| resolve_data_path("identity/device.json"))
        .ok_or_else(|| anyhow::anyhow!("cannot determine a config directory for the device identity"))
}

fn load_identity(
    config: &HostConfig,
    cache: &IdentityCache,
) -> anyhow::Result<Option<Arc<DeviceIdentity>>> {
    if !config.client.device_auth {
        return Ok(None);
    }
    let path = identity_path(config)?;
    Ok(Some(cache.load(&path)?))
}

// ── Host ────────────────────────────────────────────────────────────

async fn log_supervisor_events(mut rx: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match rx.recv().await {
            Ok(SupervisorEvent::Started { pid }) => info!(pid, "gateway started"),
            Ok(SupervisorEvent::Exited { code, signal }) => {
                info!(?code, ?signal, "gateway exited");
            }
            Ok(SupervisorEvent::Stopped) => info!("gateway stopped"),
            Ok(SupervisorEvent::Restarting { attempt, delay }) => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, "gateway restart scheduled");
            }
            Ok(SupervisorEvent::Error { message }) => warn!(%message, "gateway error"),
            Ok(SupervisorEvent::Fatal { message }) => {
                error!(%message, "gateway supervisor gave up");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "supervisor event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_client_notices(mut rx: mpsc::Receiver<ClientNotice>) {
    while let Some(notice) = rx.recv().await {
        match notice {
            ClientNotice::Connected(hello) => {
                let scopes = hello.auth.map(|a| a.scopes).unwrap_or_default();
                info!(protocol = ?hello.protocol, ?scopes, "gateway session established");
            }
            ClientNotice::Event(ev) => {
                debug!(event = %ev.event, seq = ?ev.seq, "gateway event");
            }
            ClientNotice::Gap { expected, received } => {
                warn!(expected, received, "missed gateway events");
            }
            ClientNotice::Closed { code, reason } => {
                debug!(code, %reason, "gateway session closed");
            }
            ClientNotice::ConnectError(message) => warn!(%message, "gateway connect failed"),
            ClientNotice::Reconnecting { .. } => {}
        }
    }
}

async fn run_host(cli: &Cli, no_spawn: bool) -> anyhow::Result<()> {
    let config = load_host_config(cli)?;
    let cache = IdentityCache::new();
    let identity = load_identity(&config, &cache)?;

    // Startup banner
    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ Agent Gateway Host{RESET} {DIM}v{v}{RESET}");
        if let Some(ref id) = identity {
            eprintln!("  {DIM}Device{RESET}     {CYAN}{}{RESET}", id.device_id());
        }
        eprintln!("  {DIM}Gateway{RESET}    {}", config.client.url);
        if !no_spawn {
            eprintln!(
                "  {DIM}Command{RESET}    {GREEN}●{RESET} {} {}",
                config.gateway.command,
                config.gateway.args.join(" ")
            );
        }
        eprintln!();
    }

    let supervisor = if no_spawn {
        None
    } else {
        let (supervisor, events) = Supervisor::new(config.supervisor_config());
        tokio::spawn(log_supervisor_events(events));
        supervisor.start();
        Some(supervisor)
    };

    let (client, notices) = RpcClient::new(config.client_options(), identity);
    tokio::spawn(log_client_notices(notices));
    client.start();

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    client.stop();
    if let Some(supervisor) = supervisor {
        supervisor.stop().await;
    }
    Ok(())
}

// ── One-shot call ───────────────────────────────────────────────────

async fn wait_for_session(
    notices: &mut mpsc::Receiver<ClientNotice>,
    limit: Duration,
) -> anyhow::Result<()> {
    let wait = async {
        while let Some(notice) = notices.recv().await {
            match notice {
                ClientNotice::Connected(_) => return Ok::<(), anyhow::Error>(()),
                ClientNotice::ConnectError(message) => anyhow::bail!("{message}"),
                ClientNotice::Closed { code, reason } => {
                    anyhow::bail!("gateway closed ({code}): {reason}")
                }
                _ => {}
            }
        }
        anyhow::bail!("gateway client shut down")
    };
    tokio::time::timeout(limit, wait)
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to gateway"))?
}

async fn run_call(
    cli: &Cli,
    method: &str,
    params: Option<&str>,
    timeout_ms: Option<u64>,
    expect_final: bool,
) -> anyhow::Result<()> {
    let config = load_host_config(cli)?;
    let params = params
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {e}"))?;

    let cache = IdentityCache::new();
    let identity = load_identity(&config, &cache)?;

    let mut opts = config.client_options();
    opts.auto_reconnect = false;
    let connect_limit = opts.challenge_timeout + opts.connect_timeout;
    let request_timeout = opts.request_timeout;
    let (client, mut notices) = RpcClient::new(opts, identity);
    client.start();

    let result = async {
        wait_for_session(&mut notices, connect_limit).await?;
        let opts = RequestOptions {
            timeout: timeout_ms.map_or(request_timeout, Duration::from_millis),
            expect_final,
        };
        client
            .request_with(method, params, opts)
            .await
            .map_err(|e| anyhow::anyhow!("{method} failed [{}]: {e}", e.code()))
    }
    .await;
    client.stop();

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Failed to install rustls crypto provider - may already be installed or unsupported platform");
    }

    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Run { no_spawn } => run_host(&cli, *no_spawn).await?,

        Commands::Call {
            method,
            params,
            timeout_ms,
            expect_final,
        } => run_call(&cli, method, params.as_deref(), *timeout_ms, *expect_final).await?,

        Commands::Identity => {
            let config = load_host_config(&cli)?;
            let path = identity_path(&config)?;
            let identity = agwc::identity::load_or_create_identity(&path)?;
            if std::io::stdout().is_terminal() {
                println!();
                println!("  {DIM}Device{RESET}      {CYAN}{}{RESET}", identity.device_id());
                println!("  {DIM}Public key{RESET}  {}", identity.public_key_encoded());
                println!("  {DIM}File{RESET}        {}", path.display());
                println!();
            } else {
                let out = serde_json::json!({
                    "deviceId": identity.device_id(),
                    "publicKey": identity.public_key_encoded(),
                    "path": path,
                });
                println!("{out}");
            }
        }
    }
    Ok(())
}
