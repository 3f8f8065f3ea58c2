//! Event router
//!
//! All mutable per-source state (cooldown gate, merge cache, open
//! incidents) sits behind one mutex. Admission is a single critical
//! section: two samples racing for the same source cannot both open an
//! incident. Each open incident gets one countdown task; whoever wins the
//! timer's compare-and-set (countdown, cancel or remote confirmation)
//! finalizes it, so every incident resolves exactly once.
//!
//! Finalizing is split in two. Classification, cooldown bookkeeping and the
//! `Resolved` event happen synchronously in the winner's call; escalation
//! and persistence run in a spawned task that ends with `Recorded`. A slow
//! dispatcher therefore never delays signals for other sources.

use alerting::{AdmitDecision, AlertingConfig, ConfirmationTimer, CooldownGate, TimerExit, TimerState};
use crash_detection::{ConfidenceScorer, DetectionVerdict, GeoPoint, ScorerConfig, TelemetrySample};
use event_fusion::{MergedTelemetry, PartialTelemetry, PendingEventCache};
use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use storage::{Channel, EscalationStatus, IncidentLog, Severity};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::dispatch::{DispatchError, Escalation, NotificationDispatcher};
use crate::incident::{Incident, IncidentState, SignalOutcome};
use crate::RouterError;

/// Lifecycle notification for monitoring clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "incident", rename_all = "snake_case")]
pub enum RouterEvent {
    Pending(Incident),
    /// Classified; a HIGH escalation may still be in flight
    Resolved(Incident),
    /// Escalation settled and the record appended to the log
    Recorded(Incident),
}

impl RouterEvent {
    pub fn incident(&self) -> &Incident {
        match self {
            RouterEvent::Pending(incident)
            | RouterEvent::Resolved(incident)
            | RouterEvent::Recorded(incident) => incident,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RouterEvent::Pending(_) => "pending",
            RouterEvent::Resolved(_) => "resolved",
            RouterEvent::Recorded(_) => "recorded",
        }
    }
}

/// What happened to one sample or pending report
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub verdict: DetectionVerdict,
    pub decision: AdmitDecision,
    /// The incident opened by this call, if any
    pub incident: Option<Incident>,
}

struct OpenIncident {
    incident: Incident,
    timer: ConfirmationTimer,
    started_at: Instant,
}

struct RouterState {
    gate: CooldownGate,
    cache: PendingEventCache,
    open: HashMap<String, OpenIncident>,
}

impl RouterState {
    /// Merge into the open incident, or just track the location
    fn merge(&mut self, source_id: &str, partial: &PartialTelemetry) -> Option<MergedTelemetry> {
        match self.open.get_mut(source_id) {
            Some(open) => {
                let merged = self.cache.merge(source_id, partial);
                open.incident.merged_telemetry = merged.clone();
                Some(merged)
            }
            None => {
                if let Some(location) = partial.location {
                    self.cache.note_location(source_id, location);
                }
                None
            }
        }
    }
}

struct RouterInner {
    scorer: ConfidenceScorer,
    alerting: AlertingConfig,
    config: RouterConfig,
    state: Mutex<RouterState>,
    log: Arc<IncidentLog>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    events: broadcast::Sender<RouterEvent>,
}

/// Incident router. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IncidentRouter {
    inner: Arc<RouterInner>,
}

impl IncidentRouter {
    /// Create a router
    pub fn new(
        scorer: ScorerConfig,
        alerting: AlertingConfig,
        config: RouterConfig,
        log: Arc<IncidentLog>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self, RouterError> {
        alerting.validate()?;
        config.validate()?;
        let scorer = ConfidenceScorer::new(scorer)?;

        info!(
            "Creating incident router: window={:?}, cooldown={:?}, dispatcher={}",
            alerting.confirmation_window(),
            alerting.cooldown(),
            dispatcher.name()
        );

        let state = RouterState {
            gate: CooldownGate::new(alerting.cooldown()),
            cache: PendingEventCache::new(),
            open: HashMap::new(),
        };
        let (events, _) = broadcast::channel(config.broadcast_capacity);

        Ok(Self {
            inner: Arc::new(RouterInner {
                scorer,
                alerting,
                config,
                state: Mutex::new(state),
                log,
                dispatcher,
                events,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    pub fn log(&self) -> &Arc<IncidentLog> {
        &self.inner.log
    }

    pub fn scorer(&self) -> &ConfidenceScorer {
        &self.inner.scorer
    }

    /// Score a sample and open an incident if it is admitted.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn ingest(&self, sample: TelemetrySample, channel: Channel) -> IngestOutcome {
        let mut partial = PartialTelemetry::from_sample(&sample);
        partial.location_authoritative = channel == Channel::Mobile;
        let verdict = self.inner.scorer.score(sample);
        self.admit(verdict, partial, channel)
    }

    /// Another channel's detector already fired for this source.
    ///
    /// Opens an incident through the same gate when none is open; otherwise
    /// only merges the partial telemetry into the open one.
    pub fn report_pending(
        &self,
        source_id: &str,
        partial: PartialTelemetry,
        channel: Channel,
    ) -> IngestOutcome {
        let mut sample = TelemetrySample::new(source_id);
        if let Some(g_force) = partial.g_force {
            sample = sample.with_g_force(g_force);
        }
        if let Some(tilt) = partial.tilt_deg {
            sample = sample.with_tilt(tilt);
        }
        if let Some(location) = partial.location {
            sample = sample.with_location(location);
        }
        let assessment = self.inner.scorer.assess(&sample);
        let verdict = DetectionVerdict::reported(assessment, sample);
        self.admit(verdict, partial, channel)
    }

    fn admit(&self, verdict: DetectionVerdict, partial: PartialTelemetry, channel: Channel) -> IngestOutcome {
        let source_id = verdict.sample.source_id.clone();
        let now = Instant::now();

        let mut state = self.lock();
        let decision = state.gate.admit(&source_id, &verdict, now);

        match decision {
            AdmitDecision::Admitted => {
                let merged = state.cache.open(&source_id, &partial);
                let incident = Incident::open(&source_id, channel, verdict.confidence, verdict.reason, merged);
                let timer = ConfirmationTimer::start(self.inner.alerting.confirmation_window());
                state.open.insert(
                    source_id.clone(),
                    OpenIncident {
                        incident: incident.clone(),
                        timer: timer.clone(),
                        started_at: now,
                    },
                );

                // Sent under the lock so Pending always precedes Resolved
                let mut announced = incident.clone();
                announced.countdown_secs = Some(timer.countdown_secs());
                self.broadcast(RouterEvent::Pending(announced));
                drop(state);

                counter!("incidents_opened_total").increment(1);
                info!(
                    "Incident {} opened for {} via {} (confidence {:.2}, {})",
                    incident.id,
                    source_id,
                    channel.as_str(),
                    verdict.confidence,
                    verdict.reason.as_str()
                );
                self.spawn_countdown(source_id, incident.id.clone(), timer);

                IngestOutcome {
                    verdict,
                    decision,
                    incident: Some(incident),
                }
            }
            AdmitDecision::AlreadyPending => {
                state.merge(&source_id, &partial);
                drop(state);
                counter!("detections_suppressed_total", "reason" => decision.label()).increment(1);
                IngestOutcome {
                    verdict,
                    decision,
                    incident: None,
                }
            }
            AdmitDecision::CoolingDown { .. } => {
                if let Some(location) = partial.location {
                    state.cache.note_location(&source_id, location);
                }
                drop(state);
                counter!("detections_suppressed_total", "reason" => decision.label()).increment(1);
                IngestOutcome {
                    verdict,
                    decision,
                    incident: None,
                }
            }
            AdmitDecision::NotDetected => {
                // Quiet samples still carry the location stream
                if let Some(location) = partial.location {
                    state.merge(
                        &source_id,
                        &PartialTelemetry::location(location, partial.location_authoritative),
                    );
                }
                IngestOutcome {
                    verdict,
                    decision,
                    incident: None,
                }
            }
        }
    }

    fn spawn_countdown(&self, source_id: String, incident_id: String, timer: ConfirmationTimer) {
        let router = self.clone();
        let tick = self.inner.alerting.countdown_tick();
        tokio::spawn(async move {
            match timer.run(tick).await {
                TimerExit::Expired => {
                    router.finalize(&source_id, &incident_id, IncidentState::TimedOut);
                }
                TimerExit::Superseded(state) => {
                    debug!("Countdown for {} superseded ({:?})", incident_id, state);
                }
            }
        });
    }

    /// Merge late telemetry into the source's open incident.
    ///
    /// Without an open incident only the location is retained.
    pub fn merge_telemetry(&self, source_id: &str, partial: PartialTelemetry) -> Option<MergedTelemetry> {
        self.lock().merge(source_id, &partial)
    }

    /// Location-stream update
    pub fn update_location(
        &self,
        source_id: &str,
        location: GeoPoint,
        authoritative: bool,
    ) -> Option<MergedTelemetry> {
        if !location.is_valid() {
            debug!("Ignoring invalid location for {}", source_id);
            return None;
        }
        self.merge_telemetry(source_id, PartialTelemetry::location(location, authoritative))
    }

    /// User cancel signal for the source's open incident.
    ///
    /// A cancel arriving at or past the deadline resolves the incident as
    /// TIMED_OUT and is reported as `Ignored`.
    pub async fn cancel(&self, source_id: &str) -> SignalOutcome {
        self.signal(source_id, IncidentState::Cancelled)
    }

    /// The originating device reports its own cancel window expired
    pub async fn confirm(&self, source_id: &str) -> SignalOutcome {
        self.signal(source_id, IncidentState::Confirmed)
    }

    fn signal(&self, source_id: &str, outcome: IncidentState) -> SignalOutcome {
        let target = self
            .lock()
            .open
            .get(source_id)
            .map(|open| (open.timer.clone(), open.incident.id.clone()));

        let Some((timer, incident_id)) = target else {
            debug!("{} signal for {} ignored: no open incident", outcome.as_str(), source_id);
            return SignalOutcome::Ignored;
        };

        let written = match outcome {
            IncidentState::Cancelled => timer.cancel_or_expire(),
            _ => timer.expire_now().then_some(TimerState::TimedOut),
        };

        match written {
            None => {
                debug!("{} signal for {} ignored: already resolved", outcome.as_str(), incident_id);
                SignalOutcome::Ignored
            }
            Some(TimerState::TimedOut) if outcome == IncidentState::Cancelled => {
                info!("Cancel for {} arrived after the deadline", incident_id);
                self.finalize(source_id, &incident_id, IncidentState::TimedOut);
                SignalOutcome::Ignored
            }
            Some(_) => match self.finalize(source_id, &incident_id, outcome) {
                Some(incident) => SignalOutcome::Resolved(incident),
                None => SignalOutcome::Ignored,
            },
        }
    }

    /// Resolve, classify and broadcast, then hand escalation and
    /// persistence to a background task.
    ///
    /// Only the winner of the timer's compare-and-set calls this. Must be
    /// called from within a Tokio runtime.
    fn finalize(&self, source_id: &str, incident_id: &str, outcome: IncidentState) -> Option<Incident> {
        let mut incident = {
            let mut state = self.lock();
            if state.open.get(source_id).map(|o| o.incident.id.as_str()) != Some(incident_id) {
                warn!("Incident {} is no longer open", incident_id);
                return None;
            }
            let open = state.open.remove(source_id)?;
            let merged = state.cache.clear(source_id);

            let mut incident = open.incident;
            if let Some(merged) = merged {
                incident.merged_telemetry = merged;
            }
            incident.resolve(outcome);

            state.gate.close(source_id);
            if incident.severity == Severity::High || self.inner.alerting.cooldown_on_cancel {
                state.gate.record_incident(source_id, open.started_at);
            }
            incident
        };
        incident.escalation = self.plan_escalation(&incident);

        counter!("incidents_resolved_total", "severity" => incident.severity.as_str()).increment(1);
        info!(
            "Incident {} for {} resolved {} (severity {})",
            incident.id,
            source_id,
            incident.state.as_str(),
            incident.severity.as_str()
        );
        self.broadcast(RouterEvent::Resolved(incident.clone()));

        let router = self.clone();
        let settling = incident.clone();
        tokio::spawn(async move { router.settle(settling).await });

        Some(incident)
    }

    /// Whether a resolved incident needs the dispatcher
    fn plan_escalation(&self, incident: &Incident) -> EscalationStatus {
        if incident.severity != Severity::High {
            return EscalationStatus::NotRequired;
        }
        if incident.merged_telemetry.location.is_none() && !self.inner.config.escalate_without_location {
            warn!("Escalation for {} suppressed: no location", incident.id);
            counter!("escalations_total", "status" => EscalationStatus::Suppressed.as_str()).increment(1);
            return EscalationStatus::Suppressed;
        }
        EscalationStatus::Pending
    }

    /// Escalate if planned, append the record, announce it
    async fn settle(&self, mut incident: Incident) {
        if incident.escalation == EscalationStatus::Pending {
            self.escalate(&mut incident).await;
        }

        if let Err(e) = self.inner.log.append(&incident.to_record()).await {
            error!("Failed to log incident {}: {}", incident.id, e);
        }

        self.broadcast(RouterEvent::Recorded(incident));
    }

    async fn escalate(&self, incident: &mut Incident) {
        let escalation = Escalation::from_incident(incident);
        let timeout = self.inner.config.dispatch_timeout();
        let result = match tokio::time::timeout(timeout, self.inner.dispatcher.dispatch(&escalation)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout.as_secs())),
        };

        match result {
            Ok(()) => {
                info!(
                    "Escalation for {} delivered via {}",
                    incident.id,
                    self.inner.dispatcher.name()
                );
                incident.escalation = EscalationStatus::Delivered;
            }
            Err(e) => {
                error!(
                    "Escalation for {} via {} failed: {}",
                    incident.id,
                    self.inner.dispatcher.name(),
                    e
                );
                incident.escalation = EscalationStatus::Failed;
                incident.escalation_error = Some(e.to_string());
            }
        }
        counter!("escalations_total", "status" => incident.escalation.as_str()).increment(1);
    }

    fn broadcast(&self, event: RouterEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("No monitors subscribed");
        }
    }

    /// Snapshot of all pending incidents, oldest first
    pub fn open_incidents(&self) -> Vec<Incident> {
        let state = self.lock();
        let mut incidents: Vec<Incident> = state
            .open
            .values()
            .map(|open| {
                let mut incident = open.incident.clone();
                incident.countdown_secs = Some(open.timer.countdown_secs());
                incident
            })
            .collect();
        incidents.sort_by_key(|i| i.created_at);
        incidents
    }

    pub fn open_incident(&self, source_id: &str) -> Option<Incident> {
        self.lock().open.get(source_id).map(|open| {
            let mut incident = open.incident.clone();
            incident.countdown_secs = Some(open.timer.countdown_secs());
            incident
        })
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    /// Display countdown for the source's open incident
    pub fn watch_countdown(&self, source_id: &str) -> Option<watch::Receiver<u64>> {
        self.lock().open.get(source_id).map(|open| open.timer.watch_countdown())
    }

    /// Last location seen for a source, incident or not
    pub fn last_location(&self, source_id: &str) -> Option<GeoPoint> {
        self.lock().cache.last_location(source_id)
    }
}
