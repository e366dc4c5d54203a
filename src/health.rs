use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::debug;

use crate::ostree::OstreeCli;
use crate::store::UpdateStore;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub work_root: CheckResult,
    pub ostree: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn UpdateStore>,
    pub work_root: PathBuf,
    pub ostree: OstreeCli,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(store: &dyn UpdateStore) -> CheckResult {
    match store.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("ping failed: {e:#}")),
    }
}

/// The work root must be a writable directory; it is created if missing.
async fn check_work_root(work_root: &Path) -> CheckResult {
    if let Err(e) = tokio::fs::create_dir_all(work_root).await {
        return CheckResult::unhealthy(format!("cannot create {}: {e}", work_root.display()));
    }
    let probe = work_root.join(".healthz");
    let written = tokio::fs::write(&probe, b"ok").await;
    if let Err(e) = tokio::fs::remove_file(&probe).await {
        debug!(probe = %probe.display(), error = %e, "failed to remove health probe file");
    }
    match written {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("{} not writable: {e}", work_root.display())),
    }
}

async fn check_ostree(ostree: &OstreeCli) -> CheckResult {
    match ostree.version().await {
        Ok(version) => CheckResult {
            ok: true,
            detail: Some(version),
        },
        Err(e) => CheckResult::unhealthy(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let all_ok = checks.store.ok && checks.work_root.ok && checks.ostree.ok;
    // Records can still be accepted while builds are broken.
    let any_critical = !checks.store.ok;

    if all_ok {
        HealthStatus::Ok
    } else if any_critical {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (store, work_root, ostree) = tokio::join!(
        check_store(state.store.as_ref()),
        check_work_root(&state.work_root),
        check_ostree(&state.ostree),
    );

    let checks = HealthChecks {
        store,
        work_root,
        ostree,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
