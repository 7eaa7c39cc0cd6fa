use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use seenmark_domain::seen_batch::FlushReport;

const FLUSH_CYCLES_TOTAL: &str = "seenmark_worker_flush_cycles_total";
const FLUSH_DURATION_MS: &str = "seenmark_worker_flush_duration_ms";
const MARKS_APPLIED_TOTAL: &str = "seenmark_worker_marks_applied_total";
const MERGE_WRITES_TOTAL: &str = "seenmark_worker_merge_writes_total";
const PENDING_MARKS_GAUGE: &str = "seenmark_worker_pending_marks";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_flush(tenant_id: &str, report: &FlushReport, elapsed: Duration) {
    if report.is_empty() {
        return;
    }

    counter!(FLUSH_CYCLES_TOTAL, "tenant_id" => tenant_id.to_string()).increment(1);
    histogram!(FLUSH_DURATION_MS, "tenant_id" => tenant_id.to_string())
        .record(elapsed.as_secs_f64() * 1_000.0);
    counter!(MARKS_APPLIED_TOTAL, "tenant_id" => tenant_id.to_string())
        .increment(report.marks_applied as u64);
    counter!(
        MERGE_WRITES_TOTAL,
        "tenant_id" => tenant_id.to_string(),
        "result" => "acknowledged"
    )
    .increment(report.writes as u64);
    counter!(
        MERGE_WRITES_TOTAL,
        "tenant_id" => tenant_id.to_string(),
        "result" => "failed"
    )
    .increment(report.failed_writes as u64);
}

pub fn set_pending_marks(tenant_id: &str, pending: usize) {
    gauge!(PENDING_MARKS_GAUGE, "tenant_id" => tenant_id.to_string()).set(pending as f64);
}
