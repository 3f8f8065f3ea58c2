//! Cooldown gate
//!
//! Decides whether a positive verdict may open a new incident. Holds the
//! per-source "incident open" flags and the last confirmed incident start
//! times. Not synchronized itself: the owner keeps it behind one lock so
//! the check and the open are a single critical section.

use crash_detection::DetectionVerdict;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Last confirmed incident for a source
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownRecord {
    pub source_id: String,
    pub last_incident_at: Instant,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    /// New incident may open; the source is now marked open
    Admitted,
    /// Verdict was negative
    NotDetected,
    /// An incident is already pending for this source
    AlreadyPending,
    /// Source is inside its cooldown window
    CoolingDown { remaining: Duration },
}

impl AdmitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmitDecision::Admitted)
    }

    /// Label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            AdmitDecision::Admitted => "admitted",
            AdmitDecision::NotDetected => "not_detected",
            AdmitDecision::AlreadyPending => "already_pending",
            AdmitDecision::CoolingDown { .. } => "cooldown",
        }
    }
}

/// Per-source duplicate suppression
#[derive(Debug)]
pub struct CooldownGate {
    /// Cooldown measured from the last confirmed incident start
    cooldown: Duration,
    /// Cooldown records by source id (never pruned)
    records: HashMap<String, CooldownRecord>,
    /// Sources with an open incident
    open: HashSet<String>,
}

impl CooldownGate {
    /// Create a new gate
    pub fn new(cooldown: Duration) -> Self {
        info!("Creating cooldown gate: cooldown={:?}", cooldown);
        Self {
            cooldown,
            records: HashMap::new(),
            open: HashSet::new(),
        }
    }

    /// Check admission without changing state
    pub fn check(&self, source_id: &str, verdict: &DetectionVerdict, now: Instant) -> AdmitDecision {
        if !verdict.detected {
            return AdmitDecision::NotDetected;
        }

        if self.open.contains(source_id) {
            return AdmitDecision::AlreadyPending;
        }

        if let Some(remaining) = self.remaining(source_id, now) {
            return AdmitDecision::CoolingDown { remaining };
        }

        AdmitDecision::Admitted
    }

    /// Check admission and mark the source open when admitted
    pub fn admit(&mut self, source_id: &str, verdict: &DetectionVerdict, now: Instant) -> AdmitDecision {
        let decision = self.check(source_id, verdict, now);
        match decision {
            AdmitDecision::Admitted => {
                self.open.insert(source_id.to_string());
                debug!("Admitted new incident for {}", source_id);
            }
            AdmitDecision::AlreadyPending => {
                debug!("Detection suppressed for {}: incident already pending", source_id);
            }
            AdmitDecision::CoolingDown { remaining } => {
                debug!(
                    "Detection suppressed for {}: cooldown {:.1}s remaining",
                    source_id,
                    remaining.as_secs_f64()
                );
            }
            AdmitDecision::NotDetected => {}
        }
        decision
    }

    /// Clear the open flag. Returns false if the source was not open.
    pub fn close(&mut self, source_id: &str) -> bool {
        self.open.remove(source_id)
    }

    /// Start the cooldown window from a confirmed incident's start time
    pub fn record_incident(&mut self, source_id: &str, started_at: Instant) {
        self.records.insert(
            source_id.to_string(),
            CooldownRecord {
                source_id: source_id.to_string(),
                last_incident_at: started_at,
            },
        );
    }

    pub fn is_open(&self, source_id: &str) -> bool {
        self.open.contains(source_id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn record(&self, source_id: &str) -> Option<&CooldownRecord> {
        self.records.get(source_id)
    }

    /// Time left in the cooldown window, if any. Missing record means none.
    pub fn remaining(&self, source_id: &str, now: Instant) -> Option<Duration> {
        let record = self.records.get(source_id)?;
        let elapsed = now.saturating_duration_since(record.last_incident_at);
        if elapsed >= self.cooldown {
            None
        } else {
            Some(self.cooldown - elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crash_detection::{ConfidenceScorer, TelemetrySample};

    fn detected() -> DetectionVerdict {
        ConfidenceScorer::default().score(TelemetrySample::new("H001").with_g_force(10.0))
    }

    fn quiet() -> DetectionVerdict {
        ConfidenceScorer::default().score(TelemetrySample::new("H001").with_g_force(1.0))
    }

    #[test]
    fn test_first_detection_admitted() {
        let mut gate = CooldownGate::new(Duration::from_secs(30));
        let now = Instant::now();
        assert_eq!(gate.admit("H001", &detected(), now), AdmitDecision::Admitted);
        assert!(gate.is_open("H001"));
    }

    #[test]
    fn test_negative_verdict_not_admitted() {
        let mut gate = CooldownGate::new(Duration::from_secs(30));
        assert_eq!(
            gate.admit("H001", &quiet(), Instant::now()),
            AdmitDecision::NotDetected
        );
        assert!(!gate.is_open("H001"));
    }

    #[test]
    fn test_pending_blocks_duplicates() {
        let mut gate = CooldownGate::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(gate.admit("H001", &detected(), t0).is_admitted());

        for i in 1..10 {
            let decision = gate.admit("H001", &detected(), t0 + Duration::from_secs(i));
            assert_eq!(decision, AdmitDecision::AlreadyPending);
        }
        assert_eq!(gate.open_count(), 1);
    }

    #[test]
    fn test_sources_are_independent() {
        let mut gate = CooldownGate::new(Duration::from_secs(30));
        let now = Instant::now();
        assert!(gate.admit("H001", &detected(), now).is_admitted());
        assert!(gate.admit("H002", &detected(), now).is_admitted());
    }

    #[test]
    fn test_cooldown_window() {
        let mut gate = CooldownGate::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(gate.admit("H001", &detected(), t0).is_admitted());
        gate.close("H001");
        gate.record_incident("H001", t0);

        let decision = gate.admit("H001", &detected(), t0 + Duration::from_secs(12));
        assert_eq!(
            decision,
            AdmitDecision::CoolingDown {
                remaining: Duration::from_secs(18)
            }
        );

        // boundary is inclusive: exactly 30s elapsed admits
        let decision = gate.admit("H001", &detected(), t0 + Duration::from_secs(30));
        assert!(decision.is_admitted());
    }

    #[test]
    fn test_close_without_record_allows_reopen() {
        let mut gate = CooldownGate::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(gate.admit("H001", &detected(), t0).is_admitted());
        assert!(gate.close("H001"));
        assert!(!gate.close("H001"));
        assert!(gate.admit("H001", &detected(), t0).is_admitted());
    }
}
