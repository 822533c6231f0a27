mod types;

#[cfg(feature = "tch-backend")]
mod engine;
#[cfg(feature = "tch-backend")]
mod loader;

use async_trait::async_trait;

use crate::{error::ServiceError, prompt::ChatMessage};

#[cfg(feature = "tch-backend")]
pub use engine::TchGenerator;
#[cfg(feature = "tch-backend")]
pub use loader::ModelArtifacts;
pub use types::{Completion, GenerationSettings, ModelMetadata};

/// Chat-style text generation over a loaded model.
///
/// Router state carries an `Arc<dyn TextGenerator>`, built once in `main`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        settings: GenerationSettings,
    ) -> Result<Completion, ServiceError>;

    fn metadata(&self) -> ModelMetadata;
}
