use anyhow::{Context, Result};
use facecheck_core::{spawn_extractor, FaceService, FsImageStore, Registry};
use facecheck_models::OnnxExtractor;
use facecheckd::api::{self, AppState};
use facecheckd::config::Config;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facecheckd starting");

    let config = Config::from_env();
    tracing::info!(?config, "configuration loaded");

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let extractor = OnnxExtractor::load_dir(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let extractor = spawn_extractor(extractor, config.extract_timeout())?;

    let registry = Registry::open(&config.db_path, extractor.dimension()).await?;
    let images = FsImageStore::new(&config.image_dir)?;
    tracing::info!(dir = %images.dir().display(), "image store ready");
    let service = FaceService::new(registry, extractor, Arc::new(images))
        .with_policy(config.face_policy);

    let state = Arc::new(AppState {
        service,
        default_tolerance: config.tolerance,
    });
    let app = api::router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "facecheckd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("facecheckd shutting down");
    Ok(())
}
