//! Launches builds as independent tasks and collects their reports.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::{BuildOutcome, BuildPipeline, BuildReport};
use crate::metrics::{Metrics, MetricsRegistry, Outcome, OutcomeLabels, StageLabels};
use crate::model::UpdateRecord;

/// Spawns one task per submitted record.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<BuildPipeline>,
    reports: mpsc::UnboundedSender<Arc<BuildReport>>,
    metrics: MetricsRegistry,
}

impl Dispatcher {
    /// The receiver must be drained by [`run_supervisor`].
    pub fn new(
        pipeline: Arc<BuildPipeline>,
        metrics: MetricsRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<Arc<BuildReport>>) {
        let (reports, rx) = mpsc::unbounded_channel();
        (
            Self {
                pipeline,
                reports,
                metrics,
            },
            rx,
        )
    }

    /// Start building `record` in the background.
    ///
    /// The report is sent to the supervisor and also returned through the
    /// handle; callers that don't need it can drop the handle.
    pub fn submit(&self, record: UpdateRecord) -> JoinHandle<Arc<BuildReport>> {
        let pipeline = Arc::clone(&self.pipeline);
        let reports = self.reports.clone();
        let active = self.metrics.metrics.active_builds.clone();
        let span = tracing::info_span!("build", id = record.id, account = %record.account);

        active.inc();
        tokio::spawn(
            async move {
                let report = Arc::new(pipeline.build_repo(record).await);
                active.dec();
                if reports.send(Arc::clone(&report)).is_err() {
                    warn!("build supervisor is gone; report dropped");
                }
                report
            }
            .instrument(span),
        )
    }
}

/// Drain build reports until every [`Dispatcher`] is dropped.
pub async fn run_supervisor(
    mut reports: mpsc::UnboundedReceiver<Arc<BuildReport>>,
    metrics: MetricsRegistry,
) {
    while let Some(report) = reports.recv().await {
        observe(&metrics.metrics, &report);
        log_report(&report);
    }
    debug!("build supervisor stopped");
}

fn observe(metrics: &Metrics, report: &BuildReport) {
    let outcome = match &report.outcome {
        BuildOutcome::Succeeded { deltas, upload } => {
            metrics.static_deltas_total.inc_by(deltas.len() as u64);
            metrics.upload_bytes.inc_by(upload.bytes);
            metrics.upload_objects.inc_by(upload.files);
            Outcome::Succeeded
        }
        BuildOutcome::Failed(err) => {
            metrics
                .build_failures_total
                .get_or_create(&StageLabels {
                    stage: err.stage.as_str().to_string(),
                })
                .inc();
            Outcome::Failed
        }
        BuildOutcome::Skipped => Outcome::Skipped,
    };

    metrics
        .builds_total
        .get_or_create(&OutcomeLabels {
            outcome: outcome.clone(),
        })
        .inc();
    if outcome != Outcome::Skipped {
        metrics
            .build_duration_seconds
            .observe(report.duration.as_secs_f64());
    }
}

fn log_report(report: &BuildReport) {
    let duration_ms = report.duration.as_millis() as u64;
    match &report.outcome {
        BuildOutcome::Succeeded { deltas, upload } => info!(
            id = report.id,
            account = %report.account,
            deltas = deltas.len(),
            files = upload.files,
            bytes = upload.bytes,
            duration_ms,
            "update build finished"
        ),
        BuildOutcome::Failed(err) => error!(
            id = report.id,
            account = %report.account,
            stage = %err.stage,
            kind = err.error.kind(),
            error = %err.chain_message(),
            duration_ms,
            "update build failed"
        ),
        BuildOutcome::Skipped => debug!(id = report.id, "update build skipped"),
    }
    for warning in &report.cleanup_warnings {
        warn!(id = report.id, error = %warning, "cleanup incomplete");
    }
}
