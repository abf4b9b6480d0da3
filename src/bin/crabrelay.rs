use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crabrelay::capture::SystemBackend;
use crabrelay::failover::{FailoverController, FailoverOptions, FailoverStats};
use crabrelay::session::SessionInfo;
use crabrelay::webrtc::WebRtcConnector;
use crabrelay::{RegistryStats, RelayConfig, RelayError, SessionDescription, SessionRegistry};
use serde::Serialize;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

type Registry = SessionRegistry<WebRtcConnector>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    crabrelay::init_logging();

    let args: Vec<String> = env::args().collect();
    let command = args
        .get(1)
        .filter(|arg| !arg.starts_with("--"))
        .map(String::as_str)
        .unwrap_or("serve");
    let config = load_config(&args)?;

    match command {
        "serve" => cmd_serve(config).await,
        "probe" => cmd_probe(config).await,
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Usage: crabrelay [serve|probe] [--config <path>]");
            std::process::exit(1);
        }
    }
}

fn load_config(args: &[String]) -> anyhow::Result<RelayConfig> {
    let path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match path {
        Some(path) => RelayConfig::load_from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::load_or_default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn cmd_serve(config: RelayConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_address))?;

    let connector = WebRtcConnector::new(&config);
    let registry = SessionRegistry::new(config, Arc::new(SystemBackend::new()), connector);

    let app = Router::new()
        .route("/offer", post(offer))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(registry.clone());

    log::info!("CrabRelay {} listening on {}", crabrelay::VERSION, addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested, draining sessions");
}

/// Open the configured candidates once and report which one works
async fn cmd_probe(config: RelayConfig) -> anyhow::Result<()> {
    let controller = FailoverController::open(
        config.camera.candidates.clone(),
        config.camera.capture_settings(),
        Arc::new(SystemBackend::new()),
        FailoverOptions {
            rotation_period: None,
            open_retry_backoff: config.failover.open_retry_backoff(),
        },
    )
    .await?;

    let index = controller.active_index();
    let frame = controller.read_frame().await;
    println!(
        "Candidate {} ({}) opened: {}x{} frame, {} bytes{}",
        index,
        config.camera.candidates[index],
        frame.width,
        frame.height,
        frame.size_bytes(),
        if frame.is_filler { " (read failed, filler)" } else { "" }
    );

    controller.shutdown().await;
    Ok(())
}

async fn offer(
    State(registry): State<Registry>,
    Json(offer): Json<SessionDescription>,
) -> Result<Json<SessionDescription>, ApiError> {
    let answer = registry.request_session(offer).await?;
    Ok(Json(answer))
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    streaming: bool,
    active_candidate: Option<usize>,
    subscribers: usize,
    frames_broadcast: u64,
    registry: RegistryStats,
    failover: Option<FailoverStats>,
    sessions: Vec<SessionInfo>,
}

async fn status(State(registry): State<Registry>) -> Json<StatusResponse> {
    let (subscribers, frames_broadcast) = registry.hub_stats().await.unwrap_or_default();
    Json(StatusResponse {
        version: crabrelay::VERSION,
        streaming: registry.is_streaming().await,
        active_candidate: registry.active_candidate().await,
        subscribers,
        frames_broadcast,
        registry: registry.stats().await,
        failover: registry.failover_stats().await,
        sessions: registry.sessions().await,
    })
}

struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        Self(error)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            RelayError::NegotiationError(_) => (StatusCode::BAD_REQUEST, "NEGOTIATION_ERROR"),
            RelayError::NoCandidateAvailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_CAMERA_AVAILABLE")
            }
            RelayError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            RelayError::StreamClosed => (StatusCode::SERVICE_UNAVAILABLE, "STREAM_CLOSED"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let body = ErrorBody {
            error: code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
