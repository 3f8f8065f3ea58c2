//! Incident Routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use crash_detection::sample::DEFAULT_SOURCE_ID;
use crash_detection::GeoPoint;
use event_fusion::PartialTelemetry;
use incident_router::{Incident, SignalOutcome};
use serde::{Deserialize, Serialize};
use storage::Channel;
use tracing::info;

use crate::SharedState;

/// Response for the open incidents endpoint
#[derive(Debug, Serialize)]
pub struct OpenIncidentsResponse {
    pub data: Vec<Incident>,
    pub count: usize,
}

/// Pending incidents, oldest first
pub async fn get_open(State(state): State<SharedState>) -> Json<OpenIncidentsResponse> {
    let data = state.router.open_incidents();
    Json(OpenIncidentsResponse {
        count: data.len(),
        data,
    })
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<Incident>,
}

/// Rider cancel. A cancel with nothing to resolve is not an error.
pub async fn cancel(
    State(state): State<SharedState>,
    Path(source_id): Path<String>,
) -> Json<CancelResponse> {
    let response = match state.router.cancel(&source_id).await {
        SignalOutcome::Resolved(incident) => CancelResponse {
            resolved: true,
            incident: Some(incident),
        },
        SignalOutcome::Ignored => CancelResponse {
            resolved: false,
            incident: None,
        },
    };
    Json(response)
}

/// Dashboard simulation trigger
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateRequest {
    #[serde(default = "default_helmet")]
    pub helmet_id: String,
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    #[serde(default = "default_longitude")]
    pub longitude: f64,
    #[serde(default = "default_g_force")]
    pub g_force: f64,
    #[serde(default = "default_tilt")]
    pub tilt: f64,
}

impl Default for SimulateRequest {
    fn default() -> Self {
        Self {
            helmet_id: default_helmet(),
            latitude: default_latitude(),
            longitude: default_longitude(),
            g_force: default_g_force(),
            tilt: default_tilt(),
        }
    }
}

fn default_helmet() -> String {
    DEFAULT_SOURCE_ID.to_string()
}

fn default_latitude() -> f64 {
    15.3647
}

fn default_longitude() -> f64 {
    75.1240
}

fn default_g_force() -> f64 {
    15.8
}

fn default_tilt() -> f64 {
    78.0
}

#[derive(Debug, Serialize)]
pub struct SimulateResponse {
    /// Admission decision (`admitted`, `already_pending`, `cooldown`)
    pub decision: &'static str,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<Incident>,
}

/// Open an incident as if the dashboard's detector fired
pub async fn simulate(
    State(state): State<SharedState>,
    body: Option<Json<SimulateRequest>>,
) -> (StatusCode, Json<SimulateResponse>) {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    info!("Simulated accident for {}", request.helmet_id);

    let partial = PartialTelemetry {
        g_force: Some(request.g_force),
        tilt_deg: Some(request.tilt),
        location: Some(GeoPoint::new(request.latitude, request.longitude)).filter(GeoPoint::is_valid),
        ..Default::default()
    };
    let outcome = state
        .router
        .report_pending(&request.helmet_id, partial, Channel::Dashboard);

    let status = if outcome.incident.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(SimulateResponse {
            decision: outcome.decision.label(),
            confidence: outcome.verdict.confidence,
            incident: outcome.incident,
        }),
    )
}
