mod config;
mod engine;
mod types;
mod xlm_roberta_engine;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use config::Config;
use engine::Engine;
use types::{PredictionResult, TextRequest};
use xlm_roberta_engine::{XlmRobertaConfig, XlmRobertaEngine};

const PREDICT_ROUTE: &str = "/api/v1/predict-sentiment";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vi_sentiment=debug".into()),
        )
        .init();

    let config = Config::parse();
    tracing::info!("Starting sentiment server with config: {:?}", config);

    let engine_config = XlmRobertaConfig {
        source: config.model_source(),
        tokenizer_file: config.tokenizer_file.clone(),
        use_pth: config.use_pth,
        cpu: config.cpu_only,
        max_sequence_length: config.max_sequence_length,
    };

    tracing::info!("Loading sentiment model...");
    let engine = XlmRobertaEngine::new(engine_config).await?;
    tracing::info!("Model loaded successfully");

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = router(AppState::new(Arc::new(engine), config.request_timeout()))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer);

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = first_signal(ctrl_c, terminate).await;
    tracing::info!(signal = received, "Shutting down");
}

/// Name of whichever shutdown signal fires first.
async fn first_signal(
    ctrl_c: impl Future<Output = ()>,
    terminate: impl Future<Output = ()>,
) -> &'static str {
    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<dyn Engine + Send + Sync>,
    request_timeout: Duration,
}

impl AppState {
    fn new(engine: Arc<dyn Engine + Send + Sync>, request_timeout: Duration) -> Self {
        Self {
            engine,
            request_timeout,
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(PREDICT_ROUTE, post(predict_sentiment_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tracing::instrument(skip(state, request), fields(text_len = request.text.len()))]
async fn predict_sentiment_handler(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> Result<Json<PredictionResult>, StatusCode> {
    counter!("sentiment_requests_total").increment(1);

    // Dropping the prediction on timeout tells the engine to skip queued work.
    let pending = tokio::time::timeout(state.request_timeout, state.engine.predict(request.text));
    let scores = match pending.await {
        Ok(Ok(scores)) => scores,
        Ok(Err(e)) => {
            counter!("sentiment_failures_total").increment(1);
            tracing::error!(error = %e, "Sentiment prediction failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(_) => {
            counter!("sentiment_failures_total").increment(1);
            tracing::error!(timeout = ?state.request_timeout, "Sentiment prediction timed out");
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let prediction = scores.to_prediction();
    counter!("sentiment_predictions_total", "label" => prediction.label.as_str()).increment(1);
    tracing::debug!(
        label = prediction.label.as_str(),
        confidence = prediction.confidence,
        probs = ?scores.probs(),
        "Prediction complete"
    );
    Ok(Json(prediction))
}
