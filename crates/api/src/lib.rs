//! Helmet Relay API Server
//!
//! REST API and monitoring WebSocket for the crash relay, plus the service
//! bootstrap shared by the binary.

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use incident_router::IncidentRouter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use mqtt_bridge::{build_dispatcher, MqttBridge};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::{IncidentLog, StorageError};
use thiserror::Error;
use tower_governor::GovernorLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub mod rate_limit;
mod routes;
pub mod settings;

use rate_limit::{create_governor_config, RateLimitConfig};
use settings::{LogFormat, LoggingConfig, RelaySettings, ServerConfig};

/// API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Storage(_) | ApiError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub router: IncidentRouter,
    pub version: String,
    pub start_time: std::time::Instant,
    pub mqtt_enabled: bool,
    /// Prometheus render handle, when a recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(router: IncidentRouter) -> Self {
        Self {
            router,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
            mqtt_enabled: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn with_mqtt(mut self, enabled: bool) -> Self {
        self.mqtt_enabled = enabled;
        self
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentStatus,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub router: RouterHealth,
    pub storage: StorageHealth,
    pub mqtt: String,
}

#[derive(Debug, Serialize)]
pub struct RouterHealth {
    pub status: String,
    pub open_incidents: usize,
}

#[derive(Debug, Serialize)]
pub struct StorageHealth {
    pub status: String,
    pub backend: String,
    pub records: Option<usize>,
}

/// Create the application router
pub fn create_router(state: SharedState, server: &ServerConfig) -> Result<Router, ApiError> {
    let governor = create_governor_config(&RateLimitConfig::from(server))?;

    let mut app = Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/incidents/open", get(routes::incidents::get_open))
        .route("/api/v1/incidents/:source/cancel", post(routes::incidents::cancel))
        .route(
            "/api/v1/simulate",
            post(routes::incidents::simulate).layer(GovernorLayer { config: governor }),
        )
        .route("/api/v1/accidents", get(routes::accidents::get_accidents))
        .route("/api/v1/telemetry", post(routes::telemetry::ingest))
        .route("/api/v1/location", post(routes::telemetry::update_location))
        .route("/api/v1/monitor", get(routes::monitor::monitor))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http());

    if server.cors_allow_any {
        app = app.layer(CorsLayer::permissive());
    }

    Ok(app.with_state(state))
}

/// Health check handler
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let log = state.router.log();
    let records = log.count().await;
    let storage_status = if records.is_ok() { "ok" } else { "error" };

    Json(HealthResponse {
        status: if records.is_ok() { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        components: ComponentStatus {
            router: RouterHealth {
                status: "ok".to_string(),
                open_incidents: state.router.open_count(),
            },
            storage: StorageHealth {
                status: storage_status.to_string(),
                backend: log.backend_name().to_string(),
                records: records.ok(),
            },
            mqtt: if state.mqtt_enabled { "enabled" } else { "disabled" }.to_string(),
        },
    })
}

/// Prometheus scrape endpoint
async fn metrics_handler(State(state): State<SharedState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ApiError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ApiError::Config(format!("log level {:?}: {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| ApiError::Config(format!("tracing subscriber: {}", e)))
}

/// Wire everything together and serve until Ctrl-C
pub async fn run(settings: RelaySettings) -> anyhow::Result<()> {
    let log = IncidentLog::from_config(&settings.storage)
        .await
        .with_context(|| format!("opening {:?} incident log", settings.storage.backend))?;

    let mqtt = if settings.mqtt.enabled {
        Some(MqttBridge::new(settings.mqtt.clone()).context("configuring MQTT bridge")?)
    } else {
        info!("MQTT bridge disabled");
        None
    };

    let dispatcher = build_dispatcher(&settings.notify, mqtt.as_ref().map(|(bridge, _)| bridge))
        .context("configuring escalation dispatcher")?;

    let router = IncidentRouter::new(
        settings.scorer.clone(),
        settings.alerting.clone(),
        settings.router.clone(),
        Arc::new(log),
        dispatcher,
    )
    .context("creating incident router")?;

    let mqtt_enabled = mqtt.is_some();
    if let Some((bridge, eventloop)) = mqtt {
        bridge.spawn(eventloop, router.clone());
    }

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;

    let state = Arc::new(
        AppState::new(router)
            .with_metrics(metrics)
            .with_mqtt(mqtt_enabled),
    );
    let app = create_router(state, &settings.server)?;

    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("binding {}", settings.server.bind))?;
    info!("Starting API server on {}", settings.server.bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving HTTP")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use alerting::AlertingConfig;
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::Extension;
    use axum::http::{header, Method, Request};
    use crash_detection::ScorerConfig;
    use incident_router::{BoxFuture, DispatchError, Escalation, NotificationDispatcher, RouterConfig};
    use futures_util::StreamExt;
    use incident_router::RouterEvent;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    struct AcceptAll;

    impl NotificationDispatcher for AcceptAll {
        fn name(&self) -> &'static str {
            "accept-all"
        }

        fn dispatch<'a>(&'a self, _escalation: &'a Escalation) -> BoxFuture<'a, Result<(), DispatchError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn app() -> (Router, IncidentRouter) {
        let router = IncidentRouter::new(
            ScorerConfig::default(),
            AlertingConfig::default(),
            RouterConfig::default(),
            Arc::new(IncidentLog::in_memory(100)),
            Arc::new(AcceptAll),
        )
        .unwrap();
        let state = Arc::new(AppState::new(router.clone()));
        let app = create_router(state, &ServerConfig::default())
            .unwrap()
            .layer(Extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000)))));
        (app, router)
    }

    async fn recorded(rx: &mut broadcast::Receiver<RouterEvent>) {
        while !matches!(rx.recv().await.unwrap(), RouterEvent::Recorded(_)) {}
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(&app, Method::GET, "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["router"]["open_incidents"], 0);
        assert_eq!(body["components"]["storage"]["backend"], "memory");
        assert_eq!(body["components"]["mqtt"], "disabled");
    }

    #[tokio::test]
    async fn test_telemetry_opens_incident_and_cancel_resolves() {
        let (app, router) = app();
        let mut rx = router.subscribe();

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/telemetry",
            Some(json!({"sourceId": "H001", "gForce": 7.0, "tilt": 65.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detected"], true);
        assert_eq!(body["reason"], "G_FORCE");
        assert_eq!(body["decision"], "admitted");
        assert_eq!(body["incident"]["state"], "PENDING");

        let (_, body) = send(&app, Method::GET, "/api/v1/incidents/open", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["sourceId"], "H001");

        let (status, body) = send(&app, Method::POST, "/api/v1/incidents/H001/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"], true);
        assert_eq!(body["incident"]["severity"], "LOW");

        let (_, body) = send(&app, Method::POST, "/api/v1/incidents/H001/cancel", None).await;
        assert_eq!(body["resolved"], false);

        recorded(&mut rx).await;
        let (_, body) = send(&app, Method::GET, "/api/v1/accidents?severity=LOW", None).await;
        assert_eq!(body["meta"]["count"], 1);
        assert_eq!(body["data"][0]["userResponse"], "CANCELLED");
        assert_eq!(body["data"][0]["status"], "User confirmed they are okay");
    }

    #[tokio::test]
    async fn test_monitor_streams_lifecycle_frames() {
        let (app, _) = app();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_app = app.clone();
        tokio::spawn(async move {
            axum::serve(listener, server_app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v1/monitor", addr))
            .await
            .unwrap();

        send(
            &app,
            Method::POST,
            "/api/v1/telemetry",
            Some(json!({"helmetId": "H001", "gForce": 7.0, "tilt": 65.0})),
        )
        .await;
        send(&app, Method::POST, "/api/v1/incidents/H001/cancel", None).await;

        let mut frames = Vec::new();
        while frames.len() < 3 {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("monitor frame")
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = message {
                frames.push(serde_json::from_str::<Value>(&text).unwrap());
            }
        }

        assert_eq!(frames[0]["event"], "pending");
        assert_eq!(frames[0]["incident"]["sourceId"], "H001");
        assert_eq!(frames[0]["incident"]["state"], "PENDING");
        assert_eq!(frames[1]["event"], "resolved");
        assert_eq!(frames[1]["incident"]["state"], "CANCELLED");
        assert_eq!(frames[1]["incident"]["severity"], "LOW");
        assert_eq!(frames[2]["event"], "recorded");
        assert_eq!(frames[2]["incident"]["id"], frames[0]["incident"]["id"]);
    }

    #[tokio::test]
    async fn test_quiet_sample_not_detected() {
        let (app, router) = app();
        let (_, body) = send(
            &app,
            Method::POST,
            "/api/v1/telemetry?channel=ESP32",
            Some(json!({"helmetId": "H001", "gForce": 7.0, "tilt": 0.0})),
        )
        .await;
        assert_eq!(body["detected"], false);
        assert_eq!(body["decision"], "not_detected");
        assert_eq!(router.open_count(), 0);
    }

    #[tokio::test]
    async fn test_location_update() {
        let (app, router) = app();

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/location",
            Some(json!({"helmetId": "H001", "latitude": 15.3647, "longitude": 75.124})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending"], false);
        assert!(router.last_location("H001").is_some());

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/location",
            Some(json!({"latitude": 123.0, "longitude": 75.0})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_simulate_opens_dashboard_incident() {
        let (app, router) = app();

        let (status, body) = send(&app, Method::POST, "/api/v1/simulate", Some(json!({"helmetId": "H009"}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["decision"], "admitted");
        assert_eq!(body["incident"]["channel"], "DASHBOARD");

        let open = router.open_incident("H009").unwrap();
        assert_eq!(open.merged_telemetry.g_force, Some(15.8));
        assert!(open.merged_telemetry.location.is_some());

        let (status, body) = send(&app, Method::POST, "/api/v1/simulate", Some(json!({"helmetId": "H009"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "already_pending");
    }

    #[tokio::test]
    async fn test_simulate_is_rate_limited() {
        let (app, _) = app();
        let mut limited = false;
        for i in 0..10 {
            let (status, _) = send(
                &app,
                Method::POST,
                "/api/v1/simulate",
                Some(json!({"helmetId": format!("S{}", i)})),
            )
            .await;
            if status == StatusCode::TOO_MANY_REQUESTS {
                limited = true;
                break;
            }
        }
        assert!(limited);
    }

    #[tokio::test]
    async fn test_accidents_bad_severity() {
        let (app, _) = app();
        let (status, _) = send(&app, Method::GET, "/api/v1/accidents?severity=CRITICAL", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
