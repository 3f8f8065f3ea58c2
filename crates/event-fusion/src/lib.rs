//! Event Fusion
//!
//! Reconciles telemetry for one pending incident arriving from several
//! channels:
//! - mobile sensors over the direct socket
//! - the helmet device over the broker
//! - dashboard simulations
//!
//! Each leg may carry a different subset of fields. Fields are
//! last-non-null-wins, except location, which is sticky: the first fix
//! stays unless a later one is flagged authoritative (mobile GPS beats a
//! device-side estimate).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crash_detection::{GeoPoint, TelemetrySample, Vec3};

/// One partial telemetry update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialTelemetry {
    #[serde(default)]
    pub g_force: Option<f64>,
    #[serde(default, rename = "tilt")]
    pub tilt_deg: Option<f64>,
    #[serde(default)]
    pub acceleration: Option<Vec3>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Location may replace an already cached fix
    #[serde(default)]
    pub location_authoritative: bool,
}

impl PartialTelemetry {
    /// Everything a full sample carries
    pub fn from_sample(sample: &TelemetrySample) -> Self {
        Self {
            g_force: Some(sample.effective_g_force()),
            tilt_deg: Some(sample.tilt_magnitude()),
            acceleration: Some(sample.acceleration),
            location: sample.valid_location(),
            location_authoritative: false,
        }
    }

    /// A bare location update
    pub fn location(location: GeoPoint, authoritative: bool) -> Self {
        Self {
            location: Some(location),
            location_authoritative: authoritative,
            ..Default::default()
        }
    }

    pub fn authoritative(mut self) -> Self {
        self.location_authoritative = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.g_force.is_none()
            && self.tilt_deg.is_none()
            && self.acceleration.is_none()
            && self.location.is_none()
    }
}

/// Best-known telemetry for one pending incident
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedTelemetry {
    pub g_force: Option<f64>,
    #[serde(rename = "tilt")]
    pub tilt_deg: Option<f64>,
    pub acceleration: Option<Vec3>,
    pub location: Option<GeoPoint>,
    /// Number of partial updates merged in
    pub updates: u32,
}

impl MergedTelemetry {
    /// Apply one partial update in place
    pub fn apply(&mut self, partial: &PartialTelemetry) {
        if let Some(g) = partial.g_force.filter(|v| v.is_finite()) {
            self.g_force = Some(g);
        }
        if let Some(tilt) = partial.tilt_deg.filter(|v| v.is_finite()) {
            self.tilt_deg = Some(tilt);
        }
        if let Some(accel) = partial.acceleration {
            self.acceleration = Some(accel);
        }
        if let Some(location) = partial.location.filter(GeoPoint::is_valid) {
            if self.location.is_none() || partial.location_authoritative {
                self.location = Some(location);
            }
        }
        self.updates += 1;
    }

    pub fn g_force_or_zero(&self) -> f64 {
        self.g_force.unwrap_or(0.0)
    }

    pub fn tilt_or_zero(&self) -> f64 {
        self.tilt_deg.unwrap_or(0.0)
    }
}

/// Partial-telemetry cache keyed by source id.
///
/// Holds at most one merge record per source. The record lives while the
/// source's incident is pending and is cleared when it resolves. The
/// last known location per source is kept separately and survives clears.
#[derive(Debug, Default)]
pub struct PendingEventCache {
    entries: HashMap<String, MergedTelemetry>,
    last_fix: HashMap<String, GeoPoint>,
}

impl PendingEventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh record for a newly opened incident.
    ///
    /// Any stale record for the source is discarded. If the opening update
    /// has no location, the last known fix seeds it (non-authoritative).
    pub fn open(&mut self, source_id: &str, partial: &PartialTelemetry) -> MergedTelemetry {
        let mut merged = MergedTelemetry::default();
        merged.apply(partial);
        if merged.location.is_none() {
            merged.location = self.last_fix.get(source_id).copied();
        }
        if let Some(location) = partial.location.filter(GeoPoint::is_valid) {
            self.last_fix.insert(source_id.to_string(), location);
        }
        debug!("Pending cache opened for {}", source_id);
        self.entries.insert(source_id.to_string(), merged.clone());
        merged
    }

    /// Merge a partial update into the source's record, creating it if absent
    pub fn merge(&mut self, source_id: &str, partial: &PartialTelemetry) -> MergedTelemetry {
        if let Some(location) = partial.location.filter(GeoPoint::is_valid) {
            self.last_fix.insert(source_id.to_string(), location);
        }
        let entry = self.entries.entry(source_id.to_string()).or_default();
        entry.apply(partial);
        debug!("Merged telemetry for {} ({} updates)", source_id, entry.updates);
        entry.clone()
    }

    /// Record a location fix outside of any incident
    pub fn note_location(&mut self, source_id: &str, location: GeoPoint) {
        if location.is_valid() {
            self.last_fix.insert(source_id.to_string(), location);
        }
    }

    pub fn get(&self, source_id: &str) -> Option<&MergedTelemetry> {
        self.entries.get(source_id)
    }

    pub fn last_location(&self, source_id: &str) -> Option<GeoPoint> {
        self.last_fix.get(source_id).copied()
    }

    /// Drop the record once the incident resolves
    pub fn clear(&mut self, source_id: &str) -> Option<MergedTelemetry> {
        self.entries.remove(source_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
