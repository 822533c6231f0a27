use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    extract::extract_json,
    model::{GenerationSettings, ModelMetadata, TextGenerator},
    prompt::build_messages,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub generator: Arc<dyn TextGenerator>,
}

/// Body of `POST /match-cv`. Missing or `null` fields read as empty strings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MatchRequest {
    pub cv: Option<String>,
    pub job_description: Option<String>,
}

impl MatchRequest {
    pub fn cv(&self) -> &str {
        self.cv.as_deref().unwrap_or_default()
    }

    pub fn job_description(&self) -> &str {
        self.job_description.as_deref().unwrap_or_default()
    }
}

#[derive(Serialize)]
struct MetadataResponse {
    model: ModelMetadata,
    generation: GenerationSettings,
}

pub fn build_router(config: Arc<AppConfig>, generator: Arc<dyn TextGenerator>) -> Router {
    let cors_allow_any = config.cors_allow_any;
    let state = AppState { config, generator };

    let router = Router::new()
        .route("/health", get(health))
        .route("/match-cv", post(match_cv))
        .route("/metadata", get(metadata))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_allow_any {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

fn generation_settings(config: &AppConfig) -> GenerationSettings {
    GenerationSettings {
        max_new_tokens: config.max_new_tokens,
        temperature: config.temperature,
        top_k: config.top_k,
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn match_cv(
    State(state): State<AppState>,
    Json(request): Json<MatchRequest>,
) -> Result<Json<Value>, ServiceError> {
    let messages = build_messages(request.cv(), request.job_description());
    let completion = state
        .generator
        .generate(messages, generation_settings(&state.config))
        .await?;

    info!(
        prompt_tokens = completion.prompt_tokens,
        tokens_generated = completion.tokens_generated,
        truncated = completion.truncated,
        total_time_ms = completion.total_time_ms as u64,
        "assessment generated"
    );
    if completion.truncated {
        tracing::warn!(
            max_new_tokens = state.config.max_new_tokens,
            "generation hit the token budget, output may be cut mid-JSON"
        );
    }

    Ok(Json(extract_json(&completion.text)))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        model: state.generator.metadata(),
        generation: generation_settings(&state.config),
    })
}
