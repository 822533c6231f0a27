pub mod adapter;
pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod prompt;
pub mod server;

pub use config::AppConfig;
pub use extract::extract_json;
pub use model::{Completion, GenerationSettings, ModelMetadata, TextGenerator};
pub use server::{MatchRequest, build_router};
