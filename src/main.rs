use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use storefront_api as api;
use api::{
    events::EventSender,
    gateway::{PaymentGateway, RazorpayGateway},
    services::payments::PaymentService,
};

/// Background worker for the storefront core: applies migrations and sweeps
/// abandoned online payments.
#[derive(Debug, Parser)]
#[command(name = "storefront-worker", version, about)]
struct Cli {
    /// Apply pending migrations before starting, regardless of `auto_migrate`
    #[arg(long)]
    migrate: bool,

    /// Run a single expiry sweep and exit
    #[arg(long)]
    once: bool,

    /// Override `policy.expiry_sweep_interval_secs`
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate || cli.migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(event_sender);
    let events_task = tokio::spawn(api::events::process_events(event_rx));

    let gateway: Arc<dyn PaymentGateway> = Arc::new(RazorpayGateway::new(&cfg.payment)?);
    let payments = PaymentService::new(
        db_arc.clone(),
        event_sender.clone(),
        gateway,
        cfg.payment.clone(),
        cfg.policy.clone(),
    );

    if cli.once {
        sweep(&payments).await;
    } else {
        let every = cli
            .interval
            .unwrap_or(cfg.policy.expiry_sweep_interval_secs)
            .max(1);
        info!(interval_secs = every, "Starting payment expiry sweeper");

        let mut ticker = tokio::time::interval(Duration::from_secs(every));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep(&payments).await,
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
    }

    // Dropping the last senders lets the event loop drain and exit.
    drop(payments);
    drop(event_sender);
    if let Err(e) = events_task.await {
        warn!(error = %e, "event processor ended abnormally");
    }

    match Arc::try_unwrap(db_arc) {
        Ok(pool) => api::db::close_pool(pool).await?,
        Err(_) => warn!("database pool still shared at shutdown; leaving it to drop"),
    }
    Ok(())
}

async fn sweep(payments: &PaymentService) {
    match payments.expire_stale_payments(Utc::now()).await {
        Ok(report) => info!(
            orders_cancelled = report.orders_cancelled,
            payments_failed = report.payments_failed,
            failures = report.failures,
            "Expiry sweep finished"
        ),
        Err(e) => error!(error = %e, "Expiry sweep failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
