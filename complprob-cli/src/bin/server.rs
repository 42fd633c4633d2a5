use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use complprob_cli::init_tracing;
use complprob_engine::source::registry;
use complprob_engine::{
    Backend, ClassificationUnit, ClassifyConfig, ClassifyError, LlamaCppModel, LlamaCppScorer,
    Posterior, Settings, predict_proba, predict_proba_examples,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Completion-probability classification server
#[derive(Parser, Debug)]
#[command(name = "complprob-server")]
#[command(about = "Zero-shot classification server", long_about = None)]
struct Args {
    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Settings file (defaults to ~/.config/complprob/config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only load this registry variant instead of every variant in models.toml
    #[arg(long)]
    model: Option<String>,
}

#[derive(Clone)]
struct LoadedModel {
    model: Arc<LlamaCppModel>,
    display_name: String,
}

#[derive(Clone)]
struct AppState {
    /// Loaded models keyed by variant id (e.g. "smollm2-135m-q8")
    models: Arc<HashMap<String, LoadedModel>>,
    /// Options used when a request does not carry its own
    config: Arc<ClassifyConfig>,
}

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
struct PredictRequest {
    prompts: Vec<String>,
    completions: Vec<String>,
    #[serde(default)]
    prior: Option<Vec<f64>>,
    /// Model to use (optional, uses default if not specified)
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    config: Option<ClassifyConfig>,
}

#[derive(Debug, Deserialize)]
struct PredictExamplesRequest {
    examples: Vec<ClassificationUnit>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    config: Option<ClassifyConfig>,
}

#[derive(Debug, Serialize)]
struct ProbaResponse {
    probabilities: Vec<Posterior>,
    model: String,
    inference_time_ms: f64,
}

#[derive(Debug, Serialize)]
struct LabelResponse {
    labels: Vec<String>,
    model: String,
    inference_time_ms: f64,
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
    default: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("complprob_server", args.verbose);

    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    // Load llama.cpp models from HuggingFace (driven by models.toml)
    let mut models = HashMap::new();
    for (family, variant) in registry().iter_variants() {
        let model_id = &variant.id;
        if args.model.as_ref().is_some_and(|only| only != model_id) {
            continue;
        }
        tracing::info!("Downloading model '{}' from HuggingFace...", model_id);
        let backend = match Backend::from_variant(family, variant) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!(
                    "Failed to download model '{}': {}. Set HF_TOKEN for private repos.",
                    model_id,
                    e
                );
                continue;
            }
        };
        match LlamaCppModel::from_backend(&backend, settings.model.n_ctx) {
            Ok(mut model) => {
                model.set_n_threads(settings.model.n_threads);
                tracing::info!("Model '{}' loaded successfully", model_id);
                models.insert(
                    model_id.to_string(),
                    LoadedModel {
                        model: Arc::new(model),
                        display_name: variant.display_name.clone(),
                    },
                );
            }
            Err(e) => {
                tracing::warn!("Failed to load model '{}': {}", model_id, e);
            }
        }
    }

    if models.is_empty() {
        tracing::warn!("No models loaded, classification endpoints will return 503");
    } else {
        tracing::info!("Loaded {} model(s)", models.len());
    }

    let state = AppState {
        models: Arc::new(models),
        config: Arc::new(settings.classify),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/predict_proba", post(predict_proba_handler))
        .route("/api/predict", post(predict_handler))
        .route(
            "/api/predict_proba_examples",
            post(predict_proba_examples_handler),
        )
        .route("/api/models", get(models_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(cors)
        .with_state(state);

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "complprob-engine"
    }))
}

/// Resolve the default model id from the loaded models.
///
/// Prefers the registry default if loaded, otherwise falls back to any loaded model.
fn resolve_default_model_id(models: &HashMap<String, LoadedModel>) -> Option<String> {
    let default_id = &registry().default_model;
    if models.contains_key(default_id) {
        Some(default_id.clone())
    } else {
        models.keys().min().cloned()
    }
}

async fn models_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut models: Vec<ModelInfo> = state
        .models
        .iter()
        .map(|(id, info)| ModelInfo {
            id: id.clone(),
            name: info.display_name.clone(),
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));

    Json(ModelsResponse {
        models,
        default: resolve_default_model_id(&state.models).unwrap_or_default(),
    })
}

fn lookup(state: &AppState, requested: Option<&str>) -> Result<LoadedModel, ApiError> {
    let id = match requested {
        Some(id) => id.to_string(),
        None => resolve_default_model_id(&state.models).ok_or_else(|| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "No models loaded".to_string(),
            )
        })?,
    };
    state
        .models
        .get(&id)
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Model '{}' not loaded", id)))
}

/// Map a classification error to a response. Only source failures are server errors.
fn classify_error(err: ClassifyError) -> ApiError {
    match &err {
        ClassifyError::Source { source, .. } => {
            tracing::error!("Scoring failed: {}: {}", err, source);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}: {}", err, source),
            )
        }
        ClassifyError::InvalidInput { .. }
        | ClassifyError::Tokenization { .. }
        | ClassifyError::DegenerateScores { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
    }
}

/// Run a classification job on a blocking thread with a fresh scorer.
///
/// Returns the job's output, the model's display name and the elapsed time in ms.
async fn run_job<T, F>(model: LoadedModel, job: F) -> Result<(T, String, f64), ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut LlamaCppScorer<'_>) -> complprob_engine::error::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let start = std::time::Instant::now();
        let mut scorer = model.model.scorer().map_err(|e| {
            tracing::error!("Failed to create scorer: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
        let output = job(&mut scorer).map_err(classify_error)?;
        let inference_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok((output, model.display_name, inference_time_ms))
    })
    .await
    .map_err(|e| {
        tracing::error!("Classification task failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?
}

async fn shared_proba(
    state: &AppState,
    req: PredictRequest,
) -> Result<(Vec<Posterior>, Vec<String>, String, f64), ApiError> {
    let model = lookup(state, req.model.as_deref())?;
    let config = req.config.unwrap_or_else(|| (*state.config).clone());
    let PredictRequest {
        prompts,
        completions,
        prior,
        ..
    } = req;
    tracing::debug!(
        "predict: {} prompts x {} completions",
        prompts.len(),
        completions.len()
    );

    let ((posteriors, completions), name, ms) = run_job(model, move |scorer| {
        let posteriors = predict_proba(&prompts, &completions, scorer, prior.as_deref(), &config)?;
        Ok((posteriors, completions))
    })
    .await?;
    Ok((posteriors, completions, name, ms))
}

async fn predict_proba_handler(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<ProbaResponse>, ApiError> {
    let (probabilities, _, model, inference_time_ms) = shared_proba(&state, req).await?;
    Ok(Json(ProbaResponse {
        probabilities,
        model,
        inference_time_ms,
    }))
}

async fn predict_handler(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<LabelResponse>, ApiError> {
    let tie_break = req.config.as_ref().unwrap_or(&*state.config).tie_break;
    let (posteriors, completions, model, inference_time_ms) = shared_proba(&state, req).await?;
    let labels = posteriors
        .iter()
        .map(|p| completions[p.argmax(tie_break)].clone())
        .collect();
    Ok(Json(LabelResponse {
        labels,
        model,
        inference_time_ms,
    }))
}

async fn predict_proba_examples_handler(
    State(state): State<AppState>,
    Json(req): Json<PredictExamplesRequest>,
) -> Result<Json<ProbaResponse>, ApiError> {
    let model = lookup(&state, req.model.as_deref())?;
    let config = req.config.unwrap_or_else(|| (*state.config).clone());
    let examples = req.examples;
    tracing::debug!("predict_examples: {} units", examples.len());

    let (probabilities, model, inference_time_ms) = run_job(model, move |scorer| {
        predict_proba_examples(&examples, scorer, &config)
    })
    .await?;
    Ok(Json(ProbaResponse {
        probabilities,
        model,
        inference_time_ms,
    }))
}
