mod cli;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use console_proxy::{
    BridgeLimits, Gateway, GatewayConfig, GatewayHandler, HttpAuthority, TcpConnector,
};

use crate::cli::Cli;

const COMPONENT: &str = "console-gateway";
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config and apply CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(ref authority_url) = cli.authority_url {
        cfg.authority.url = authority_url.clone();
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        authority = %cfg.authority.url,
        "console-gateway starting"
    );

    // 4. Start audit logger.
    let (audit, audit_handle) = match &cfg.logging.audit_log_path {
        Some(path) => {
            let (sink, handle) = AuditSink::start(path)
                .await
                .context("failed to start audit logger")?;
            info!(path = %path.display(), "audit log enabled");
            (sink, Some(handle))
        }
        None => {
            info!("audit log disabled");
            (AuditSink::disabled(), None)
        }
    };

    // 5. Build the collaborators.
    let listen_addr: SocketAddr = cfg
        .network
        .listen_addr
        .parse()
        .context("invalid listen address")?;

    let origins = cfg
        .origins
        .to_policy()
        .context("invalid console origin configuration")?;

    let authority_url = url::Url::parse(&cfg.authority.url).context("invalid authority url")?;
    let authority = HttpAuthority::new(
        authority_url,
        cfg.authority.timeout(),
        cfg.authority.bearer_token.clone(),
    )
    .context("failed to build authority client")?;

    let connector = TcpConnector::new(
        Duration::from_secs(cfg.backend.connect_timeout_secs),
        cfg.backend.connect_attempts,
        Duration::from_millis(cfg.backend.retry_delay_ms),
    );

    let handler = GatewayHandler::new(
        Arc::new(origins),
        Arc::new(authority),
        Arc::new(connector),
        cfg.authority.timeout(),
    );

    audit
        .log(AuditEntry::new(
            AuditEventType::GatewayStarted,
            AuditSource::new(COMPONENT),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config.display().to_string(),
                "listen_addr": listen_addr.to_string(),
            }),
        ))
        .await;

    // 6. Serve until ctrl-c or SIGTERM.
    let gateway = Gateway::new(GatewayConfig {
        listen_addr,
        handler,
        audit: audit.clone(),
        bridge: BridgeLimits {
            backend_write_timeout: Duration::from_secs(cfg.backend.write_timeout_secs),
            ..BridgeLimits::default()
        },
    });
    let result = gateway.run_until(shutdown_signal()).await;

    // 7. Log shutdown and drain the audit writer.
    info!("console-gateway shutting down");

    audit
        .log(AuditEntry::new(
            AuditEventType::GatewayStopped,
            AuditSource::new(COMPONENT),
            serde_json::json!({
                "result": format!("{:?}", result),
            }),
        ))
        .await;

    // Bridges still running hold sink clones, so the writer may not finish.
    drop(audit);
    if let Some(handle) = audit_handle {
        match tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "audit writer task failed"),
            Err(_) => warn!("audit writer still busy at exit; open bridges not recorded"),
        }
    }

    result
}

/// Resolves on the first ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
        _ = terminate => info!("received SIGTERM"),
    }
}
