use std::sync::{atomic::Ordering, Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    config::ScanOptions,
    scanner::{self, Collaborators, SharedProgress},
    targets::DiscoveryRequest,
    types::ScanReport,
};

/// Builds collaborators for each accepted scan.
pub type CollaboratorFactory = Arc<dyn Fn(&ScanOptions) -> Collaborators + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // shared mutable state for progress/results
    collaborators: CollaboratorFactory,
}

impl AppState {
    pub fn new(collaborators: CollaboratorFactory) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            collaborators,
        }
    }

    pub fn live() -> Self {
        Self::new(Arc::new(Collaborators::live))
    }
}

#[derive(Debug, Default)]
struct ServerState {
    state: RunState,
    results: Option<Vec<ScanReport>>,
    progress: Option<SharedProgress>,
    cancel: Option<CancellationToken>,
    last_error: Option<String>,
    /// Bumped per accepted scan; only the current run may publish its outcome.
    run_id: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: RunState,
    pub hosts_seen: u64,
    pub hosts_scanned: u64,
    pub rows: u64,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(flatten)]
    pub request: DiscoveryRequest,
    #[serde(default)]
    pub options: ScanOptions,
}

pub fn router(state: AppState) -> Router {
    let results = Router::new()
        .route("/results", get(get_results))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/cancel", post(post_cancel))
        .merge(results)
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn spawn_server(bind: &str) -> Result<()> {
    let app = router(AppState::live());
    info!(%bind, "serving discovery API");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let (hosts_seen, hosts_scanned, rows) = match (&s.progress, &s.results) {
        (Some(p), _) => (
            p.hosts_seen.load(Ordering::Relaxed),
            p.hosts_scanned.load(Ordering::Relaxed),
            p.rows_found.load(Ordering::Relaxed),
        ),
        (None, Some(r)) => (0, 0, r.len() as u64),
        (None, None) => (0, 0, 0),
    };
    let out = Status {
        state: s.state,
        hosts_seen,
        hosts_scanned,
        rows,
        error: s.last_error.clone(),
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if let Some(res) = s.results.as_ref() {
        (StatusCode::OK, Json(res.clone())).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.cancel.as_ref() {
        Some(c) => {
            c.cancel();
            StatusCode::ACCEPTED
        }
        None => StatusCode::CONFLICT,
    }
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    // Validate up front so bad ranges are a 400, not a failed background run.
    if let Err(e) = req.request.plan() {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let progress = SharedProgress::new();
    let cancel = CancellationToken::new();
    let collaborators = (app.collaborators)(&req.options);

    let run_id = {
        let mut s = app.inner.write().await;
        // Cancel any existing scan
        if let Some(c) = s.cancel.take() {
            c.cancel();
        }
        s.run_id += 1;
        s.state = RunState::Running;
        s.results = None;
        s.last_error = None;
        s.progress = Some(progress.clone());
        s.cancel = Some(cancel.clone());
        s.run_id
    };

    let app2 = app.clone();
    tokio::spawn(async move {
        let res = scanner::discover(
            &req.request,
            &req.options,
            collaborators,
            cancel.clone(),
            progress.clone(),
        )
        .await;

        let mut s = app2.inner.write().await;
        if s.run_id != run_id {
            debug!(run_id, current = s.run_id, "superseded scan finished; dropping its outcome");
            return;
        }
        match res {
            Ok(results) => {
                s.state = RunState::Done;
                s.results = Some(results);
            }
            Err(e) => {
                warn!(error = %e, "discovery failed");
                s.state = RunState::Failed;
                s.last_error = Some(e.to_string());
            }
        }
        s.progress = None;
        s.cancel = None;
    });

    let status = Status {
        state: RunState::Running,
        hosts_seen: 0,
        hosts_scanned: 0,
        rows: 0,
        error: None,
    };
    (StatusCode::ACCEPTED, Json(status)).into_response()
}
