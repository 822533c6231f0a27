use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{Completion, GenerationSettings, ModelArtifacts, ModelMetadata, TextGenerator},
    prompt::ChatMessage,
};

/// The libtorch-backed generator: base model with the adapter merged in.
pub struct TchGenerator {
    artifacts: Arc<ModelArtifacts>,
}

impl TchGenerator {
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let artifacts = ModelArtifacts::load(config)?;
        Ok(Self {
            artifacts: Arc::new(artifacts),
        })
    }
}

#[async_trait]
impl TextGenerator for TchGenerator {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        settings: GenerationSettings,
    ) -> Result<Completion, ServiceError> {
        let artifacts = self.artifacts.clone();

        task::spawn_blocking(move || {
            let prompt = artifacts.template.render(&messages, true)?;
            artifacts.complete(&prompt, settings)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    fn metadata(&self) -> ModelMetadata {
        self.artifacts.model.metadata()
    }
}
