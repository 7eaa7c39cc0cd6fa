mod intake;
mod observability;

use std::sync::Arc;
use std::time::Duration;

use seenmark_domain::ports::db::DbAdapter;
use seenmark_domain::ports::seen::SeenLedgerStore;
use seenmark_domain::seen_batch::{
    FlushObserver, FlushReport, SeenBatchAccumulator, SeenFlushScheduler, run_intake,
};
use seenmark_infra::config::AppConfig;
use seenmark_infra::db::{DbConfig, SurrealAdapter};
use seenmark_infra::logging::init_tracing;
use seenmark_infra::repositories::{InMemorySeenLedgerStore, SurrealSeenLedgerStore};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    if config.metrics_enabled {
        observability::init_metrics()?;
    }

    let store = build_store(&config).await?;
    let accumulator = Arc::new(SeenBatchAccumulator::new(
        config.seen_tenant_id.clone(),
        store,
        config.seen_batch_config(),
    ));

    let observer: FlushObserver = {
        let accumulator = accumulator.clone();
        Arc::new(move |report: &FlushReport, elapsed: Duration| {
            observability::register_flush(accumulator.tenant_id(), report, elapsed);
            observability::set_pending_marks(accumulator.tenant_id(), accumulator.pending_marks());
        })
    };
    let scheduler = SeenFlushScheduler::new(accumulator.clone(), config.flush_interval())
        .with_observer(observer)
        .spawn();

    info!(
        tenant_id = %config.seen_tenant_id,
        backend = %config.data_backend,
        interval_ms = config.seen_flush_interval_ms,
        "seen worker started"
    );
    let (events_tx, events_rx) = mpsc::channel(config.intake_capacity());
    let intake_task = tokio::spawn(run_intake(accumulator.clone(), events_rx));
    let mut input = tokio::spawn(intake::forward_event_lines(
        BufReader::new(tokio::io::stdin()),
        events_tx,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        outcome = &mut input => match outcome {
            Ok(Ok(forwarded)) => info!(forwarded, "seen event input closed"),
            Ok(Err(err)) => warn!(error = %err, "seen event input failed"),
            Err(err) => warn!(error = %err, "seen event input task failed"),
        },
    }
    // dropping the reader drops the last sender, which ends the intake
    input.abort();
    let intake_report = intake_task.await?;

    let report = scheduler.shutdown().await?;
    if let Some(rendered) = observability::render_metrics() {
        tracing::debug!(metrics = %rendered, "final metrics snapshot");
    }
    info!(
        received = intake_report.received,
        marks_applied = report.marks_applied,
        failed_writes = report.failed_writes,
        "seen worker shutdown"
    );

    Ok(())
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SeenLedgerStore>> {
    if !config.uses_surreal() {
        info!("using in-memory seen ledger store");
        return Ok(Arc::new(InMemorySeenLedgerStore::new()));
    }

    let db_config = DbConfig::from_app_config(config);
    let adapter = SurrealAdapter::new(db_config.clone());
    adapter.health_check().await.map_err(|err| {
        tracing::error!(
            backend = adapter.name(),
            endpoint = adapter.endpoint(),
            error = %err,
            "db health check failed"
        );
        err
    })?;
    Ok(Arc::new(SurrealSeenLedgerStore::new(&db_config).await?))
}
