//! HTTP service: generate-and-detect, health, configuration, the
//! quarantine registry and analysis jobs.
//!
//! Pipeline calls block on the runtime session, so every one of them runs
//! under `spawn_blocking`; a panic there becomes a 500, not a dead worker.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use modx_core::{
    AnalysisJob, GenerateRequest, InferenceResult, ModxError, Orchestrator, QuarantineEntry,
    SaeArtifactError,
};

use crate::jobs::{JobError, JobRegistry};

/// Static facts reported by `/config`.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub model_id: String,
    pub device: String,
    pub sae_base_path: String,
}

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub jobs: JobRegistry,
    pub info: ServiceInfo,
}

type SharedState = Arc<AppState>;

// --- Errors ---

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    error_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

/// Every failed request answers with `{error, error_type, details?}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error_type: &'static str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                error_type,
                details: None,
            },
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.body.details = Some(details);
        self
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", what)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ModxError> for ApiError {
    fn from(e: ModxError) -> Self {
        let status = match &e {
            ModxError::Validation(_) => StatusCode::BAD_REQUEST,
            ModxError::ModelNotLoaded | ModxError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
            ModxError::Generation(_)
            | ModxError::Probe(_)
            | ModxError::SaeArtifact(_)
            | ModxError::FeatureRegistry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let err = Self::new(status, e.kind(), e.to_string());
        match &e {
            ModxError::SaeArtifact(artifact) => {
                let converted = !matches!(artifact, SaeArtifactError::Missing { .. });
                err.with_details(serde_json::json!({
                    "layer": artifact.layer(),
                    "converted": converted,
                }))
            }
            _ => err,
        }
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Reference(e) => e.into(),
            JobError::Store(e) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
            }
        }
    }
}

impl From<JoinError> for ApiError {
    fn from(e: JoinError) -> Self {
        tracing::error!("request worker failed: {e}");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "request worker failed",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", e.body_text())
    }
}

// --- Response types ---

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    sae_loaded: bool,
    feature_detector_ready: bool,
    model_id: Option<String>,
    layer: Option<usize>,
    loaded_layers: Vec<usize>,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    model_id: String,
    layer: usize,
    device: String,
    sae_base_path: String,
    quarantined_features_count: usize,
}

#[derive(Debug, Serialize)]
struct FeaturesResponse<'a> {
    features: Vec<&'a QuarantineEntry>,
    total: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalyzeRequest {
    model_url: String,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ListModelsResponse {
    models: Vec<AnalysisJob>,
    total: usize,
}

// --- Handlers ---

async fn root() -> Json<Value> {
    Json(serde_json::json!({
        "service": "modx",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn generate(
    State(state): State<SharedState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<InferenceResult>, ApiError> {
    let Json(request) = body?;
    let orchestrator = Arc::clone(&state.orchestrator);
    let result = tokio::task::spawn_blocking(move || orchestrator.run(&request)).await??;
    Ok(Json(result))
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let orchestrator = &state.orchestrator;
    let model = orchestrator.model_info();
    let layer = orchestrator.settings().layer;
    let sae_loaded = orchestrator.saes().is_loaded(layer);
    Json(HealthResponse {
        // the registry is loaded before the listener binds
        status: "healthy",
        model_loaded: model.is_some(),
        sae_loaded,
        feature_detector_ready: true,
        model_id: model.map(|m| m.model_id),
        layer: sae_loaded.then_some(layer),
        loaded_layers: orchestrator.saes().loaded_layers(),
    })
}

async fn config(State(state): State<SharedState>) -> Json<ConfigResponse> {
    let orchestrator = &state.orchestrator;
    Json(ConfigResponse {
        model_id: orchestrator
            .model_info()
            .map(|m| m.model_id)
            .unwrap_or_else(|| state.info.model_id.clone()),
        layer: orchestrator.settings().layer,
        device: state.info.device.clone(),
        sae_base_path: state.info.sae_base_path.clone(),
        quarantined_features_count: orchestrator.detector().registry().len(),
    })
}

async fn features(State(state): State<SharedState>) -> Response {
    let registry = state.orchestrator.detector().registry();
    Json(FeaturesResponse {
        features: registry.iter().collect(),
        total: registry.len(),
    })
    .into_response()
}

async fn analyze_model(
    State(state): State<SharedState>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AnalysisJob>), ApiError> {
    let Json(request) = body?;
    let job = state.jobs.submit(&request.model_url)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn list_models(
    State(state): State<SharedState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ListModelsResponse>, ApiError> {
    let Query(params) = params?;
    Ok(Json(ListModelsResponse {
        models: state.jobs.list(params.limit)?,
        total: state.jobs.count()?,
    }))
}

async fn get_model(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<AnalysisJob>, ApiError> {
    let not_found = || ApiError::not_found(format!("no analysis job {id}"));
    let uuid = Uuid::parse_str(&id).map_err(|_| not_found())?;
    state.jobs.get(uuid)?.map(Json).ok_or_else(not_found)
}

pub fn router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/features", get(features))
        .route("/models/analyze", post(analyze_model))
        .route("/models", get(list_models))
        .route("/models/{id}", get(get_model));

    Router::new()
        .route("/", get(root))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested, draining in-flight requests");
}

/// Bind and serve until ctrl-c or SIGTERM.
pub async fn serve(state: SharedState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use modx_core::mock::{InMemoryLoader, ScriptedRuntime};
    use modx_core::{
        DetectorConfig, FeatureDetector, ModelRuntime, PipelineSettings, QuarantineRegistry,
        SaeManager,
    };
    use modx_store::JobStore;
    use std::time::Duration;
    use tower::ServiceExt;

    const REGISTRY: &str = r#"{"3": {"description": "deceptive intent", "severity": "high"}, "5": "manipulation"}"#;

    fn state_with(runtime: impl ModelRuntime + 'static) -> SharedState {
        let detector = FeatureDetector::new(
            Arc::new(QuarantineRegistry::from_json_str(REGISTRY).unwrap()),
            DetectorConfig::default(),
        )
        .unwrap();
        // hidden unit 0 drives feature 3, unit 3 drives feature 5
        let loader = InMemoryLoader::new().with_routes(21, 8, &[(0, 3), (1, 1), (2, 2), (3, 5)]);
        let orchestrator = Arc::new(Orchestrator::new(
            runtime,
            Arc::new(SaeManager::new(loader)),
            detector,
            PipelineSettings::default(),
        ));
        Arc::new(AppState {
            jobs: JobRegistry::new(JobStore::open_in_memory().unwrap(), Arc::clone(&orchestrator)),
            orchestrator,
            info: ServiceInfo {
                model_id: "org/model".into(),
                device: "cpu".into(),
                sae_base_path: "/tmp/saes".into(),
            },
        })
    }

    /// Two prompt tokens plus one generated token; unit 0 fires at position 2.
    fn scripted() -> ScriptedRuntime {
        ScriptedRuntime::new("org/model", 32, 4)
            .with_generation(vec![7])
            .with_activations(vec![
                vec![0.0, 0.0, 0.0, 0.0],
                vec![0.0, 0.5, 0.0, 1.25],
                vec![2.5, 0.0, 0.0, 0.0],
            ])
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_root() {
        let app = router(state_with(scripted()));
        let (status, body) = send(app, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "modx");
        assert_eq!(body["status"], "running");
    }

    #[tokio::test]
    async fn test_generate_flags_quarantined_features() {
        let state = state_with(scripted());
        let (status, body) = send(
            router(Arc::clone(&state)),
            "POST",
            "/api/v1/generate",
            Some(r#"{"prompt": "hello world", "temperature": 0.0, "do_sample": false}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["generated_text"], "t7");
        assert_eq!(body["has_quarantined_features"], true);

        let hits = body["activated_features"].as_array().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["feature_index"], 3);
        assert_eq!(hits[0]["activation_value"], 2.5);
        assert_eq!(hits[0]["token_position"], 2);
        assert_eq!(hits[0]["severity"], "high");
        assert_eq!(hits[1]["feature_index"], 5);
        assert_eq!(hits[1]["token_position"], 1);

        let meta = &body["generation_metadata"];
        assert_eq!(meta["layer"], 21);
        assert_eq!(meta["hook_point"], "blocks.21.hook_resid_post");
        assert_eq!(meta["sequence_length"], 3);
        assert_eq!(meta["generation_config"]["temperature"], 0.0);
        assert!(body["warnings"].is_null());

        let (_, health) = send(router(state), "GET", "/api/v1/health", None).await;
        assert_eq!(health["sae_loaded"], true);
        assert_eq!(health["layer"], 21);
        assert_eq!(health["loaded_layers"], serde_json::json!([21]));
    }

    #[tokio::test]
    async fn test_unknown_field_is_400() {
        let app = router(state_with(scripted()));
        let (status, body) = send(
            app,
            "POST",
            "/api/v1/generate",
            Some(r#"{"prompt": "hi", "temprature": 0.5}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "validation_error");
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let app = router(state_with(scripted()));
        let (status, body) = send(app, "POST", "/api/v1/generate", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "validation_error");
    }

    #[tokio::test]
    async fn test_out_of_range_parameters_are_400() {
        for body in [
            r#"{"prompt": ""}"#,
            r#"{"prompt": "hi", "temperature": 2.5}"#,
            r#"{"prompt": "hi", "top_p": 1.5}"#,
            r#"{"prompt": "hi", "top_k": 0}"#,
            r#"{"prompt": "hi", "max_new_tokens": 0}"#,
            r#"{"prompt": "hi", "layer": 99}"#,
        ] {
            let app = router(state_with(scripted()));
            let (status, json) = send(app, "POST", "/api/v1/generate", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}: {json}");
        }
    }

    #[tokio::test]
    async fn test_missing_artifact_is_500_with_details() {
        let app = router(state_with(scripted()));
        let (status, body) = send(
            app,
            "POST",
            "/api/v1/generate",
            Some(r#"{"prompt": "hello world", "layer": 5}"#),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error_type"], "sae_artifact_error");
        assert_eq!(body["details"]["layer"], 5);
        assert_eq!(body["details"]["converted"], false);
    }

    #[tokio::test]
    async fn test_no_model_is_503() {
        let app = router(state_with(ScriptedRuntime::unloaded(32, 4)));
        let (status, body) = send(
            app,
            "POST",
            "/api/v1/generate",
            Some(r#"{"prompt": "hello"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error_type"], "model_not_loaded");
    }

    #[tokio::test]
    async fn test_failed_model_override_is_503() {
        let app = router(state_with(scripted()));
        let body = format!(
            r#"{{"prompt": "hello", "model_id": "{}"}}"#,
            ScriptedRuntime::UNLOADABLE
        );
        let (status, json) = send(app, "POST", "/api/v1/generate", Some(&body)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error_type"], "model_load_error");
    }

    #[tokio::test]
    async fn test_health_and_config() {
        let state = state_with(ScriptedRuntime::unloaded(32, 4));
        let (status, health) = send(router(Arc::clone(&state)), "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["model_loaded"], false);
        assert_eq!(health["sae_loaded"], false);
        assert_eq!(health["feature_detector_ready"], true);
        assert!(health["model_id"].is_null());
        assert_eq!(health["loaded_layers"], serde_json::json!([]));

        let (_, config) = send(router(state), "GET", "/api/v1/config", None).await;
        assert_eq!(config["model_id"], "org/model");
        assert_eq!(config["layer"], 21);
        assert_eq!(config["device"], "cpu");
        assert_eq!(config["quarantined_features_count"], 2);
    }

    #[tokio::test]
    async fn test_features() {
        let app = router(state_with(scripted()));
        let (status, body) = send(app, "GET", "/api/v1/features", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["features"][0]["feature_index"], 3);
        assert_eq!(body["features"][1]["description"], "manipulation");
    }

    #[tokio::test]
    async fn test_analyze_lifecycle() {
        let state = state_with(ScriptedRuntime::unloaded(32, 4));
        let (status, job) = send(
            router(Arc::clone(&state)),
            "POST",
            "/api/v1/models/analyze",
            Some(r#"{"model_url": "https://huggingface.co/org/other-model"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(job["status"], "pending");
        assert_eq!(job["model_id"], "org/other-model");
        let id = job["id"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for _ in 0..200 {
            let (status, body) = send(
                router(Arc::clone(&state)),
                "GET",
                &format!("/api/v1/models/{id}"),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            last = body;
            if last["status"] == "completed" || last["status"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last["status"], "completed", "{last}");
        assert_eq!(last["result"]["hidden_dim"], 4);

        let (_, list) = send(router(state), "GET", "/api/v1/models?limit=10", None).await;
        assert_eq!(list["total"], 1);
        assert_eq!(list["models"][0]["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_analyze_rejects_bad_reference() {
        let app = router(state_with(scripted()));
        let (status, body) = send(
            app,
            "POST",
            "/api/v1/models/analyze",
            Some(r#"{"model_url": "not a model"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "validation_error");
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let state = state_with(scripted());
        let (status, body) = send(
            router(Arc::clone(&state)),
            "GET",
            &format!("/api/v1/models/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_type"], "not_found");

        let (status, _) = send(router(state), "GET", "/api/v1/models/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
