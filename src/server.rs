use std::{net::IpAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::services::ServeDir;

use crate::{
    config::ScanParameters,
    error::ScanError,
    orchestrator::{Orchestrator, StatusSnapshot},
    ranking,
};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>, // shared scan state for progress/results
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub params: Option<ScanParameters>,
}

#[derive(Debug, Deserialize)]
pub struct SingleIpRequest {
    pub ip: IpAddr,
    #[serde(default)]
    pub params: Option<ScanParameters>,
}

pub async fn spawn_server(bind: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let state = AppState { orchestrator };

    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/cancel", post(post_cancel))
        .route("/results", get(get_results))
        .route("/test", post(post_test))
        .with_state(state);

    let static_svc = ServeDir::new("ui").append_index_html_on_directories(true);

    let app = Router::new().nest("/api", api).fallback_service(static_svc);

    tracing::info!("serving UI on http://{bind}");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    match app.orchestrator.current_session().await {
        Some(session) => (StatusCode::OK, Json(session.status().await)),
        None => (StatusCode::OK, Json(StatusSnapshot::idle())),
    }
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    if let Some(session) = app.orchestrator.current_session().await {
        let results = session.results().await;
        if !results.is_empty() {
            return (StatusCode::OK, Json(ranking::snapshot(&results))).into_response();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    let params = match resolve_params(&req) {
        Ok(params) => params,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    match app.orchestrator.start_scan(params).await {
        Ok((session, _handle)) => {
            (StatusCode::ACCEPTED, Json(session.status().await)).into_response()
        }
        Err(ScanError::AlreadyRunning) => {
            (StatusCode::CONFLICT, "already_running").into_response()
        }
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    if app.orchestrator.cancel().await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn post_test(
    State(app): State<AppState>,
    Json(req): Json<SingleIpRequest>,
) -> impl IntoResponse {
    let params = req.params.unwrap_or_default();
    match app.orchestrator.single_ip_test(req.ip, params).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(ScanError::AlreadyRunning) => {
            (StatusCode::CONFLICT, "already_running").into_response()
        }
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

fn resolve_params(req: &ScanRequest) -> Result<ScanParameters, String> {
    if let Some(params) = req.params {
        return Ok(params); // validated by start_scan
    }
    match req.preset.as_deref() {
        None => Ok(ScanParameters::default()),
        Some(name) => {
            ScanParameters::preset(name).ok_or_else(|| format!("unknown preset: {name}"))
        }
    }
}
