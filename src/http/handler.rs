//! Main axum router and HTTP request handlers.
//!
//! Routes (`{prefix}` is `server.api_prefix`):
//! - `POST {prefix}/updates`      - Validate, create and dispatch an update
//! - `GET  {prefix}/updates`      - The caller account's updates
//! - `GET  {prefix}/updates/{id}` - One update, scoped to the caller account
//! - `GET  /healthz`              - Health check
//! - `GET  /metrics`              - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tracing::{error, info, instrument};

use crate::error::PipelineError;
use crate::model::{NewUpdate, UpdateRecord};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let prefix = state.config.server.api_prefix.trim_end_matches('/').to_string();
    Router::new()
        .route(
            &format!("{prefix}/updates"),
            get(list_updates).post(create_update),
        )
        .route(&format!("{prefix}/updates/{{id}}"), get(get_update))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST {prefix}/updates`
///
/// The build runs in the background; the response carries the PENDING record.
#[instrument(skip_all)]
async fn create_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<NewUpdate>, JsonRejection>,
) -> Result<(StatusCode, Json<UpdateRecord>), AppError> {
    let account = extract_account(&headers, &state.config.server.account_header)?;
    let Json(update) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    update.validate()?;

    let record = state.store.create(&account, update).await?;
    info!(
        id = record.id,
        %account,
        old_commits = record.old_commits.len(),
        "update submitted"
    );

    // The supervisor collects the report.
    drop(state.dispatcher.submit(record.clone()));

    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET {prefix}/updates`
async fn list_updates(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UpdateRecord>>, AppError> {
    let account = extract_account(&headers, &state.config.server.account_header)?;
    Ok(Json(state.store.list(&account).await?))
}

/// `GET {prefix}/updates/{id}`
#[instrument(skip(state, headers))]
async fn get_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<Json<UpdateRecord>, AppError> {
    let account = extract_account(&headers, &state.config.server.account_header)?;
    state
        .store
        .get(&account, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("update {id} not found")))
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        store: Arc::clone(&state.store),
        work_root: state.config.build.work_root.clone(),
        ostree: state.ostree.clone(),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// The caller's account from the identity header set by the gateway.
fn extract_account(headers: &HeaderMap, header_name: &str) -> Result<String, AppError> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| AppError::BadRequest(format!("missing {header_name} header")))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error that converts into an HTTP response.
#[derive(Debug)]
pub enum AppError {
    /// Malformed submission or missing identity.
    BadRequest(String),
    /// Absent, or owned by another account.
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg }))).into_response()
            }
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": msg }))).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde_json::{json, Value};

    use super::*;
    use crate::config::tests::storage_config;
    use crate::config::{BuildConfig, Config, ServerConfig};
    use crate::metrics::MetricsRegistry;
    use crate::ostree::fake::FakeRepoTool;
    use crate::ostree::OstreeCli;
    use crate::pipeline::tests::Harness;
    use crate::pipeline::{run_supervisor, Dispatcher};

    const PREFIX: &str = "/api/edge/v1";

    struct Server {
        addr: SocketAddr,
        harness: Harness,
        client: reqwest::Client,
        _tmp: tempfile::TempDir,
    }

    impl Server {
        fn url(&self, path: &str) -> String {
            format!("http://{}{path}", self.addr)
        }

        fn tarball(&self, hash: &str) -> String {
            format!("http://{}/images/{hash}.tar", self.harness.addr)
        }
    }

    async fn spawn_server() -> Server {
        let h = Harness::new(FakeRepoTool::default()).await;
        let tmp = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::new();
        let store = h.store.clone();
        let (dispatcher, rx) = Dispatcher::new(h.pipeline.clone(), metrics.clone());
        tokio::spawn(run_supervisor(rx, metrics.clone()));

        let state = Arc::new(AppState {
            config: Arc::new(Config {
                server: ServerConfig::default(),
                build: BuildConfig {
                    work_root: tmp.path().join("work"),
                    ..BuildConfig::default()
                },
                storage: storage_config("/srv/repos"),
                keydb: None,
            }),
            store,
            dispatcher,
            metrics,
            ostree: OstreeCli::new("/nonexistent/bin/ostree"),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        Server {
            addr,
            harness: h,
            client: reqwest::Client::new(),
            _tmp: tmp,
        }
    }

    fn submission(server: &Server, update: &str) -> Value {
        json!({
            "update_commit": {
                "ostree_ref": "rhel/9/x86_64/edge",
                "build_hash": update,
                "tar_url": server.tarball(update),
                "build_date": "2024-03-01",
                "build_number": 3
            },
            "inventory_hosts": ["host-a"]
        })
    }

    #[tokio::test]
    async fn create_then_read_scoped_to_account() {
        let server = spawn_server().await;

        let resp = server
            .client
            .post(server.url(&format!("{PREFIX}/updates")))
            .header("x-account", "acct-a")
            .json(&submission(&server, "c1"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let created: Value = resp.json().await.unwrap();
        assert_eq!(created["state"], "PENDING");
        assert_eq!(created["account"], "acct-a");
        let id = created["id"].as_u64().unwrap();

        let own = server
            .client
            .get(server.url(&format!("{PREFIX}/updates/{id}")))
            .header("x-account", "acct-a")
            .send()
            .await
            .unwrap();
        assert_eq!(own.status(), reqwest::StatusCode::OK);

        let other = server
            .client
            .get(server.url(&format!("{PREFIX}/updates/{id}")))
            .header("x-account", "acct-b")
            .send()
            .await
            .unwrap();
        assert_eq!(other.status(), reqwest::StatusCode::NOT_FOUND);

        let listed: Vec<Value> = server
            .client
            .get(server.url(&format!("{PREFIX}/updates")))
            .header("x-account", "acct-b")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected() {
        let server = spawn_server().await;
        let mut body = submission(&server, "c1");
        body["update_commit"]["build_hash"] = json!("../escape");

        let resp = server
            .client
            .post(server.url(&format!("{PREFIX}/updates")))
            .header("x-account", "acct-a")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let server = spawn_server().await;

        let resp = server
            .client
            .post(server.url(&format!("{PREFIX}/updates")))
            .header("x-account", "acct-a")
            .json(&json!({ "old_commits": [], "inventory_hosts": ["host-a"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("update_commit"), "{body}");

        let resp = server
            .client
            .post(server.url(&format!("{PREFIX}/updates")))
            .header("x-account", "acct-a")
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_account_header_is_rejected() {
        let server = spawn_server().await;

        let resp = server
            .client
            .post(server.url(&format!("{PREFIX}/updates")))
            .json(&submission(&server, "c1"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = server
            .client
            .get(server.url(&format!("{PREFIX}/updates")))
            .header("x-account", "  ")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_and_health_are_served() {
        let server = spawn_server().await;

        let metrics = server.client.get(server.url("/metrics")).send().await.unwrap();
        assert_eq!(metrics.status(), reqwest::StatusCode::OK);
        assert!(metrics.text().await.unwrap().contains("edgeupdates_active_builds"));

        let health: Value = server
            .client
            .get(server.url("/healthz"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["checks"]["ostree"]["ok"], false);
    }

    #[test]
    fn extract_account_trims_value() {
        let mut headers = HeaderMap::new();
        headers.insert("x-account", " 6089719 ".parse().unwrap());
        assert_eq!(extract_account(&headers, "x-account").unwrap(), "6089719");
        assert!(extract_account(&headers, "x-rh-account").is_err());
    }
}
