//! Telemetry Routes

use axum::{
    extract::{Query, State},
    Json,
};
use crash_detection::sample::DEFAULT_SOURCE_ID;
use crash_detection::{DetectionReason, GeoPoint, TelemetrySample};
use event_fusion::MergedTelemetry;
use incident_router::Incident;
use serde::{Deserialize, Serialize};
use storage::Channel;

use crate::{ApiError, SharedState};

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    /// Channel the sample came from; mobile when absent
    #[serde(default)]
    pub channel: Channel,
}

#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    pub detected: bool,
    pub confidence: f64,
    pub reason: DetectionReason,
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<Incident>,
}

/// Score one sample from the sensor stream
pub async fn ingest(
    State(state): State<SharedState>,
    Query(params): Query<ChannelQuery>,
    Json(sample): Json<TelemetrySample>,
) -> Json<TelemetryResponse> {
    let outcome = state.router.ingest(sample, params.channel);
    Json(TelemetryResponse {
        detected: outcome.verdict.detected,
        confidence: outcome.verdict.confidence,
        reason: outcome.verdict.reason,
        decision: outcome.decision.label(),
        incident: outcome.incident,
    })
}

/// Location-stream update
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    #[serde(default = "default_source", alias = "helmetId", alias = "clientId")]
    pub source_id: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon", alias = "lng")]
    pub longitude: f64,
    /// Phone GPS fixes win over device estimates
    #[serde(default = "default_authoritative")]
    pub authoritative: bool,
}

fn default_source() -> String {
    DEFAULT_SOURCE_ID.to_string()
}

fn default_authoritative() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct LocationResponse {
    /// Whether an incident is pending for the source
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<MergedTelemetry>,
}

pub async fn update_location(
    State(state): State<SharedState>,
    Json(update): Json<LocationUpdate>,
) -> Result<Json<LocationResponse>, ApiError> {
    let location = GeoPoint::new(update.latitude, update.longitude);
    if !location.is_valid() {
        return Err(ApiError::BadRequest(format!(
            "invalid location {}, {}",
            update.latitude, update.longitude
        )));
    }

    let merged = state
        .router
        .update_location(&update.source_id, location, update.authoritative);
    Ok(Json(LocationResponse {
        pending: merged.is_some(),
        merged,
    }))
}
