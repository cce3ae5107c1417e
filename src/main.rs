//! Camwatch - Camera AI watcher
//!
//! Main entry point for the Camwatch service.

use camwatch::{
    config_store::ConfigStore,
    detection_registry::DetectionRegistry,
    frame_hub::FrameHub,
    mqtt_publisher::MqttPublisher,
    orchestrator::AnalysisOrchestrator,
    state::{AppConfig, AppState},
    web_api,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camwatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Camwatch v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        settings_path = %config.settings_path.display(),
        "Configuration loaded"
    );

    // Initialize components
    let config_store = Arc::new(ConfigStore::load(config.settings_path.clone()).await?);
    tracing::info!("ConfigStore initialized");

    let registry = Arc::new(DetectionRegistry::new());
    tracing::info!("DetectionRegistry initialized");

    let mqtt_settings = config_store.mqtt_settings().await?;
    tracing::info!(
        broker = %mqtt_settings.broker,
        port = mqtt_settings.port,
        topic_prefix = %mqtt_settings.topic_prefix,
        device_id = %mqtt_settings.device_id,
        "MQTT settings loaded"
    );

    let mqtt = MqttPublisher::connect(mqtt_settings, registry.clone());
    tracing::info!("MqttPublisher initialized");

    let frame_hub = FrameHub::new();

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        config_store.clone(),
        registry.clone(),
        mqtt.clone(),
        frame_hub.clone(),
    ));
    tracing::info!("AnalysisOrchestrator initialized");

    // Create application state
    let state = AppState {
        config: config.clone(),
        config_store,
        registry,
        mqtt,
        orchestrator,
        frame_hub,
    };

    // Create router
    let app = web_api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
