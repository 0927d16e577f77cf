//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    backend: &'static str,
    data_root: DataRootHealth,
}

#[derive(Serialize)]
pub struct DataRootHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint.
///
/// Verifies the job root is writable, the only dependency the inline
/// deployment has. Returns 503 when it is not.
pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let root = state.kernel.jobs.root();
    let data_root = match std::fs::create_dir_all(root)
        .and_then(|_| {
            let probe = root.join(".health_probe");
            std::fs::write(&probe, b"ok")?;
            std::fs::remove_file(&probe)
        }) {
        Ok(()) => DataRootHealth {
            status: "ok".to_string(),
            error: None,
        },
        Err(e) => DataRootHealth {
            status: "error".to_string(),
            error: Some(e.to_string()),
        },
    };

    let healthy = data_root.status == "ok";
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        backend: state.kernel.config.queue_backend.as_str(),
        data_root,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
