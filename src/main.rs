//! ARBITER: opportunity detection and execution engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the risk state from the audit log, then runs the scanner,
//! worker pools, health checks and control server until Ctrl+C.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use arbiter::config::AppConfig;
use arbiter::control::{self, ControlState};
use arbiter::data::http::HttpPriceSource;
use arbiter::data::PriceSource;
use arbiter::engine::Engine;
use arbiter::providers::http::HttpTransport;
use arbiter::providers::{ProviderRegistry, Transport};
use arbiter::storage::AuditLog;

const BANNER: &str = r#"
    _    ____  ____ ___ _____ _____ ____
   / \  |  _ \| __ )_ _|_   _| ____|  _ \
  / _ \ | |_) |  _ \| |  | | |  _| | |_) |
 / ___ \|  _ <| |_) | |  | | | |___|  _ <
/_/   \_\_| \_\____/___| |_| |_____|_| \_\

  Opportunity detection and execution engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("ARBITER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        engine = %cfg.engine.name,
        starting_capital = %cfg.engine.starting_capital,
        providers = cfg.providers.len(),
        sources = cfg.sources.len(),
        dry_run = cfg.executor.dry_run,
        "ARBITER starting up"
    );

    // -- Components ------------------------------------------------------

    let registry = Arc::new(ProviderRegistry::new(&cfg.providers, cfg.registry.clone()));
    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::new(&cfg.providers, cfg.executor.attempt_timeout())
            .context("Failed to build provider transport")?,
    );
    let audit = AuditLog::open(&cfg.audit.database_url).await?;
    let engine = Arc::new(Engine::build(&cfg, registry.clone(), transport.clone(), audit)?);

    // -- Restore state ---------------------------------------------------

    let restored = engine.restore().await?;
    if restored.is_halted() {
        warn!(
            reason = restored.halt_reason.as_ref().map(|r| r.to_string()).unwrap_or_default(),
            "Restored in HALTED state; POST /reset-halt to resume execution"
        );
    }

    // -- Start -----------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sources: Vec<Arc<dyn PriceSource>> = cfg
        .sources
        .iter()
        .map(|s| {
            HttpPriceSource::new(s.clone(), registry.clone(), cfg.scanner.poll_timeout())
                .map(|src| Arc::new(src) as Arc<dyn PriceSource>)
                .with_context(|| format!("Failed to build price source {}", s.name))
        })
        .collect::<Result<_>>()?;

    let health = registry.clone().spawn_health_checks(transport, shutdown_rx.clone());
    let pipeline = engine.start(sources, shutdown_rx.clone());

    let control = if cfg.control.enabled {
        let reset_token = match cfg.control.reset_token_env.as_deref() {
            Some(env) => match AppConfig::resolve_env(env) {
                Ok(token) => Some(SecretString::new(token)),
                Err(e) => {
                    warn!(error = %e, "Reset token unavailable; write endpoints disabled");
                    None
                }
            },
            None => None,
        };
        let state = Arc::new(ControlState {
            engine: engine.clone(),
            reset_token,
        });
        Some(control::spawn_control(state, cfg.control.port, shutdown_rx.clone()))
    } else {
        None
    };

    info!("Engine running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received.");

    // -- Shutdown --------------------------------------------------------

    let _ = shutdown_tx.send(true);
    pipeline.join().await;
    let _ = health.await;
    if let Some(handle) = control {
        let _ = handle.await;
    }

    let state = engine.risk.snapshot();
    info!(
        executions = state.executions,
        realized_pnl = %state.realized_pnl,
        halted = state.is_halted(),
        "ARBITER shut down cleanly."
    );
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arbiter=info"));

    if std::env::var("ARBITER_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
