//! Proxy-node control agent.
//!
//! Serves the control API over HTTPS and supervises the local Xray core.
//! Every option can be given as a flag or through the environment.

use std::{collections::BTreeSet, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use clap::{ArgAction, Parser, builder::BoolishValueParser};
use node_core::{
    NodeSettings,
    settings::{DEFAULT_API_PORT, DEFAULT_SERVICE_PORT},
};
use node_executor::XrayExecutor;
use node_session::{ProcessSupervisor, SupervisorOptions};
use node_transport::{AppState, create_router, load_server_config};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Time in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Proxy-node control agent
#[derive(Parser, Debug)]
#[command(name = "node-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Control API bind host
    #[arg(long, env = "SERVICE_HOST", default_value = "0.0.0.0")]
    service_host: String,

    /// Control API bind port
    #[arg(long, env = "SERVICE_PORT", default_value_t = DEFAULT_SERVICE_PORT)]
    service_port: u16,

    /// Host of the API inbound injected into every core config
    #[arg(long, env = "XRAY_API_HOST", default_value = "0.0.0.0")]
    xray_api_host: String,

    /// Port of the API inbound injected into every core config
    #[arg(long, env = "XRAY_API_PORT", default_value_t = DEFAULT_API_PORT)]
    xray_api_port: u16,

    /// Xray executable
    #[arg(long, env = "XRAY_EXECUTABLE_PATH", default_value = "/usr/local/bin/xray")]
    xray_executable_path: PathBuf,

    /// Xray asset directory
    #[arg(long, env = "XRAY_ASSETS_PATH", default_value = "/usr/local/share/xray")]
    xray_assets_path: PathBuf,

    /// Write the core config to this file instead of piping it through stdin
    #[arg(long, env = "XRAY_CONFIG_PATH")]
    xray_config_path: Option<String>,

    /// Server certificate (PEM)
    #[arg(long, env = "SSL_CERT_FILE", default_value = "/var/lib/proxy-node/ssl_cert.pem")]
    ssl_cert_file: PathBuf,

    /// Server private key (PEM)
    #[arg(long, env = "SSL_KEY_FILE", default_value = "/var/lib/proxy-node/ssl_key.pem")]
    ssl_key_file: PathBuf,

    /// Trust anchor for control-plane client certificates (PEM)
    #[arg(long, env = "SSL_CLIENT_CERT_FILE")]
    ssl_client_cert_file: Option<String>,

    /// Comma separated inbound tags to keep; empty keeps all
    #[arg(long, env = "INBOUNDS", default_value = "")]
    inbounds: String,

    /// Verbose logging
    #[arg(
        long,
        env = "DEBUG",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    debug: bool,

    /// Seconds a started core gets to become healthy
    #[arg(long, env = "STARTUP_TIMEOUT", default_value_t = 5.0)]
    startup_timeout: f64,

    /// Seconds a stopping core gets before it is killed
    #[arg(long, env = "STOP_GRACE", default_value_t = 5.0)]
    stop_grace: f64,
}

impl Args {
    fn into_settings(self) -> Result<NodeSettings> {
        let startup_timeout = seconds("STARTUP_TIMEOUT", self.startup_timeout)?;
        let stop_grace = seconds("STOP_GRACE", self.stop_grace)?;

        Ok(NodeSettings {
            service_host: self.service_host,
            service_port: self.service_port,
            api_host: self.xray_api_host,
            api_port: self.xray_api_port,
            executable_path: self.xray_executable_path,
            assets_path: self.xray_assets_path,
            config_path: non_empty(self.xray_config_path.as_deref()).map(PathBuf::from),
            ssl_cert_file: self.ssl_cert_file,
            ssl_key_file: self.ssl_key_file,
            ssl_client_cert_file: non_empty(self.ssl_client_cert_file.as_deref())
                .map(PathBuf::from),
            inbounds: split_inbounds(&self.inbounds),
            debug: self.debug,
            startup_timeout,
            stop_grace,
        })
    }
}

/// An empty variable counts as unset.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn split_inbounds(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(String::from)
        .collect()
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{name} must be a non-negative number of seconds"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Args::parse().into_settings()?;

    let default_level = if settings.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();

    settings.validate().context("invalid configuration")?;
    run(settings).await
}

async fn run(settings: NodeSettings) -> Result<()> {
    tracing::info!(
        host = %settings.service_host,
        port = settings.service_port,
        "starting proxy-node agent"
    );

    if settings.ssl_client_cert_file.is_none() {
        tracing::warn!(
            "SSL_CLIENT_CERT_FILE is not set: any client can connect to this node, \
             this is not secure"
        );
    }

    let tls = load_server_config(
        &settings.ssl_cert_file,
        &settings.ssl_key_file,
        settings.ssl_client_cert_file.as_deref(),
    )
    .context("failed to load TLS material")?;

    let supervisor = ProcessSupervisor::new(
        XrayExecutor::from_settings(&settings),
        SupervisorOptions::from_settings(&settings),
    );
    match supervisor.probe_version().await {
        Some(version) => tracing::info!(%version, "found xray core"),
        None => tracing::warn!(
            path = %settings.executable_path.display(),
            "could not determine xray version"
        ),
    }

    let addr = resolve(&settings.service_host, settings.service_port).await?;
    let state = AppState::new(supervisor, settings);
    let supervisor = Arc::clone(&state.supervisor);
    let app = create_router(state);

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    tracing::info!(%addr, "control API listening");
    let served = axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(tls)))
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .with_context(|| format!("control API on {addr} failed"));

    if let Err(e) = supervisor.stop().await {
        tracing::error!(error = %e, "failed to stop xray core on shutdown");
    }
    tracing::info!("agent stopped");
    served
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?;
    match addrs.next() {
        Some(addr) => Ok(addr),
        None => bail!("{host}:{port} resolved to no address"),
    }
}

async fn shutdown_on_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown requested");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
