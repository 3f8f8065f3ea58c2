//! Telemetry samples
//!
//! Samples arrive from several channels with different subsets of fields
//! populated. Anything missing, `null` or non-finite is read as zero so a
//! malformed sample can always be scored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Source id assumed when a channel omits it
pub const DEFAULT_SOURCE_ID: &str = "H001";

/// Three-axis vector (acceleration in g, rotation in rad/s)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub x: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub y: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm, with non-finite components read as zero
    pub fn magnitude(&self) -> f64 {
        let s = self.sanitized();
        (s.x * s.x + s.y * s.y + s.z * s.z).sqrt()
    }

    fn sanitized(&self) -> Self {
        Self {
            x: finite_or_zero(self.x),
            y: finite_or_zero(self.y),
            z: finite_or_zero(self.z),
        }
    }
}

/// GPS fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon", alias = "lng")]
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// A fix is usable only when both coordinates are finite and in range.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One telemetry sample from a sensing channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    /// Magnitude of 3-axis acceleration (g)
    #[serde(default, deserialize_with = "lenient_f64")]
    pub g_force: f64,

    #[serde(rename = "pitch", alias = "pitchDeg", default, deserialize_with = "lenient_f64")]
    pub pitch_deg: f64,

    #[serde(rename = "roll", alias = "rollDeg", default, deserialize_with = "lenient_f64")]
    pub roll_deg: f64,

    #[serde(rename = "tilt", alias = "tiltDeg", default, deserialize_with = "lenient_f64")]
    pub tilt_deg: f64,

    #[serde(default)]
    pub acceleration: Vec3,

    #[serde(default)]
    pub rotation: Vec3,

    #[serde(default)]
    pub location: Option<GeoPoint>,

    #[serde(alias = "helmetId", alias = "clientId", default = "default_source_id")]
    pub source_id: String,

    #[serde(with = "chrono::serde::ts_milliseconds", default = "now")]
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    /// Create an all-zero sample for a source, stamped now
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            g_force: 0.0,
            pitch_deg: 0.0,
            roll_deg: 0.0,
            tilt_deg: 0.0,
            acceleration: Vec3::default(),
            rotation: Vec3::default(),
            location: None,
            source_id: source_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Build a sample from raw accelerometer/gyroscope readings.
    ///
    /// gForce is the acceleration magnitude; pitch and roll are derived from
    /// the gravity vector; tilt is the larger of the two.
    pub fn from_motion(
        source_id: impl Into<String>,
        acceleration: Vec3,
        rotation: Vec3,
        location: Option<GeoPoint>,
    ) -> Self {
        let a = acceleration.sanitized();
        let pitch = a.x.atan2((a.y * a.y + a.z * a.z).sqrt()).to_degrees();
        let roll = a.y.atan2((a.x * a.x + a.z * a.z).sqrt()).to_degrees();

        Self {
            g_force: a.magnitude(),
            pitch_deg: pitch,
            roll_deg: roll,
            tilt_deg: pitch.abs().max(roll.abs()),
            acceleration: a,
            rotation,
            location,
            ..Self::new(source_id)
        }
    }

    pub fn with_g_force(mut self, g_force: f64) -> Self {
        self.g_force = g_force;
        self
    }

    pub fn with_tilt(mut self, tilt_deg: f64) -> Self {
        self.tilt_deg = tilt_deg;
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    /// gForce with NaN/inf read as zero
    pub fn effective_g_force(&self) -> f64 {
        finite_or_zero(self.g_force)
    }

    /// Largest absolute angle among tilt, pitch and roll
    pub fn tilt_magnitude(&self) -> f64 {
        finite_or_zero(self.tilt_deg)
            .abs()
            .max(finite_or_zero(self.pitch_deg).abs())
            .max(finite_or_zero(self.roll_deg).abs())
    }

    /// Location if it is a usable fix
    pub fn valid_location(&self) -> Option<GeoPoint> {
        self.location.filter(GeoPoint::is_valid)
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn default_source_id() -> String {
    DEFAULT_SOURCE_ID.to_string()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Accepts a number or `null`; `null` becomes zero.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.map(finite_or_zero).unwrap_or(0.0))
}
