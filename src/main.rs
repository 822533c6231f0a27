use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cv_matcher_service::{AppConfig, TextGenerator, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        base_model = %config.base_model_id,
        adapter = %config.adapter_id,
        "loading model artifacts"
    );

    let generator = load_generator(config.as_ref())?;
    tracing::info!(metadata = ?generator.metadata(), "models loaded");

    let router = build_router(config.clone(), generator);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(feature = "tch-backend")]
fn load_generator(config: &AppConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    let generator = cv_matcher_service::model::TchGenerator::initialize(config)?;
    Ok(Arc::new(generator))
}

#[cfg(not(feature = "tch-backend"))]
fn load_generator(_config: &AppConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    anyhow::bail!("built without the tch-backend feature, no model backend available")
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
