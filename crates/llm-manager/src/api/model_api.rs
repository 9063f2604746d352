//! API endpoints for model lifecycle: bulk initialize, download-and-load,
//! cascade delete, listing, parameter changes and GGUF inspection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path as FsPath;
use tracing::{info, warn};

use super::record;
use crate::download::ModelDownloader;
use crate::error::{ManagerError, ManagerResult};
use crate::model_runtime::{BackendKind, FormatDetector, ModelInfo, ModelSpec, ParameterReport, ParameterUpdate};
use crate::shared_state::AppState;

fn default_model_type() -> String {
    "llama".to_string()
}

#[derive(Debug, Deserialize)]
pub struct InitializeRequest {
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddModelRequest {
    pub model_id: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub model_url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub n_threads: Option<u32>,
    #[serde(default)]
    pub n_gpu_layers: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub keep_file_on_error: bool,
    #[serde(default)]
    pub download_only: bool,
    #[serde(default)]
    pub auto_correct_type: bool,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub model_path: String,
}

/// Loads every declared model. Failures are skipped; the response lists the
/// ids that made it.
pub async fn initialize(
    State(state): State<AppState>,
    Json(req): Json<InitializeRequest>,
) -> Json<Value> {
    let loaded = state.load_models(&req.models).await;
    info!("Initialized {}/{} model(s)", loaded.len(), req.models.len());
    crate::metrics::inc_request("initialize", "ok");

    Json(json!({
        "success": true,
        "models": loaded,
    }))
}

fn analysis_value(path: &FsPath) -> Option<Value> {
    let is_gguf = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);
    if !is_gguf {
        return None;
    }
    Some(match FormatDetector::analyze(path) {
        Ok(analysis) => serde_json::to_value(analysis).unwrap_or(Value::Null),
        Err(e) => json!({ "error": e }),
    })
}

/// Switches `model_type` to what the file header says, when that maps onto
/// a supported type.
fn corrected_type(requested: &str, analysis: Option<&Value>) -> Option<&'static str> {
    let arch = analysis?.get("detected_architecture")?.as_str()?;
    let detected = FormatDetector::model_type_for_architecture(arch)?;
    (detected != requested).then_some(detected)
}

fn load_suggestion(model_type: &str, analysis: Option<&Value>) -> String {
    match corrected_type(model_type, analysis) {
        Some(detected) => format!(
            "The file looks like a '{}' model. Retry with model_type '{}' or set auto_correct_type",
            detected, detected
        ),
        None => "Check that model_type matches the file and that its runtime is configured".to_string(),
    }
}

/// Downloads a weight file into the model directory and loads it.
pub async fn add_llm(State(state): State<AppState>, Json(req): Json<AddModelRequest>) -> Response {
    match add_model(&state, req).await {
        Ok(body) => {
            crate::metrics::inc_request("add_llm", "ok");
            Json(body).into_response()
        }
        Err((status, body)) => {
            crate::metrics::inc_request("add_llm", "error");
            (status, Json(body)).into_response()
        }
    }
}

fn failure(err: ManagerError) -> (StatusCode, Value) {
    (err.status_code(), json!({ "error": err.to_string() }))
}

async fn add_model(state: &AppState, req: AddModelRequest) -> Result<Value, (StatusCode, Value)> {
    if req.model_id.trim().is_empty() {
        return Err(failure(ManagerError::InvalidRequest("model_id is required".to_string())));
    }
    if req.model_url.trim().is_empty() {
        return Err(failure(ManagerError::InvalidRequest("model_url is required".to_string())));
    }
    if state.store.contains_model(&req.model_id) {
        return Err(failure(ManagerError::ModelExists(req.model_id.clone())));
    }

    let file_name = ModelDownloader::resolve_file_name(&req.model_id, &req.model_url, req.file_name.as_deref())
        .map_err(failure)?;
    let file_path = state
        .downloader
        .download(&req.model_url, &file_name)
        .await
        .map_err(failure)?;
    let analysis = analysis_value(&file_path);

    if req.download_only {
        return Ok(json!({
            "success": true,
            "model_id": req.model_id,
            "file_path": file_path.display().to_string(),
            "analysis": analysis,
            "message": "Model downloaded successfully",
        }));
    }

    let mut model_type = req.model_type.clone();
    if req.auto_correct_type {
        if let Some(detected) = corrected_type(&model_type, analysis.as_ref()) {
            warn!(
                "Model {}: switching model_type from '{}' to detected '{}'",
                req.model_id, model_type, detected
            );
            model_type = detected.to_string();
        }
    }

    // The file already sits under MODEL_DIR, so the model path stays relative.
    let spec = ModelSpec {
        id: req.model_id.clone(),
        model_type: model_type.clone(),
        path: file_name,
        endpoint: req.endpoint.clone(),
        context_window: req.context_window,
        n_threads: req.n_threads,
        n_gpu_layers: req.n_gpu_layers,
        temperature: req.temperature,
    };

    match state.load_model(&spec).await {
        Ok(model_info) => {
            info!("Added model {} from {}", req.model_id, req.model_url);
            Ok(json!({
                "success": true,
                "model_id": req.model_id,
                "file_path": file_path.display().to_string(),
                "model_info": model_info,
                "analysis": analysis,
            }))
        }
        Err(e) => {
            let file_status = if req.keep_file_on_error {
                "kept"
            } else if state.store.source_in_use(&file_path.display().to_string()) {
                "in_use"
            } else {
                match tokio::fs::remove_file(&file_path).await {
                    Ok(()) => "deleted",
                    Err(rm) => {
                        warn!("Failed to remove {} after load error: {}", file_path.display(), rm);
                        "delete_failed"
                    }
                }
            };
            warn!("Loading downloaded model {} failed: {}", req.model_id, e);

            Err((
                e.status_code(),
                json!({
                    "error": e.to_string(),
                    "file_path": file_path.display().to_string(),
                    "file_status": file_status,
                    "suggestion": load_suggestion(&model_type, analysis.as_ref()),
                    "supported_types": BackendKind::supported_types(),
                    "analysis": analysis,
                }),
            ))
        }
    }
}

/// Removes a model and its conversations once the queue reaches the request.
pub async fn delete_llm(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, ManagerError> {
    let dropped = record("delete_llm", state.dispatch.delete_model(&model_id).await)?;

    Ok(Json(json!({
        "success": true,
        "model_id": model_id,
        "message": format!(
            "Model {} deleted along with {} conversation(s)",
            model_id, dropped
        ),
    })))
}

pub async fn list_models(State(state): State<AppState>) -> Json<BTreeMap<String, ModelInfo>> {
    let mut models = BTreeMap::new();
    for handle in state.store.models() {
        models.insert(handle.id.clone(), handle.info().await);
    }
    crate::metrics::inc_request("list_models", "ok");
    Json(models)
}

pub async fn modify_parameters(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(update): Json<ParameterUpdate>,
) -> Result<Json<ParameterReport>, ManagerError> {
    let report = record(
        "modify_parameters",
        state.dispatch.modify_parameters(&model_id, update).await,
    )?;
    if !report.errors.is_empty() {
        warn!("Parameter changes for {} rejected: {:?}", model_id, report.errors);
    }
    Ok(Json(report))
}

pub async fn analyze_model(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<Value>, ManagerError> {
    let path = state.config.resolve_model_path(&req.model_path);
    let result: ManagerResult<Value> = if path.exists() {
        FormatDetector::analyze_with_recommendation(&path)
            .map_err(ManagerError::InvalidRequest)
            .and_then(|analysis| serde_json::to_value(analysis).map_err(|e| ManagerError::Internal(e.into())))
    } else {
        Err(ManagerError::ModelFileNotFound(req.model_path))
    };

    Ok(Json(record("analyze_model", result)?))
}
