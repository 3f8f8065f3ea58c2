//! Broker subscriber and status republisher

use alerting::AdmitDecision;
use incident_router::{Incident, IncidentRouter, RouterEvent, SignalOutcome};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::wire::{HelmetEvent, HelmetEventKind, StatusMessage};
use crate::BridgeError;

/// Queue between the broker loop and the router, in arrival order
const INBOUND_QUEUE: usize = 64;

/// What a helmet event did to the router
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Opened(Incident),
    /// Telemetry merged into the already open incident
    Merged,
    Suppressed(AdmitDecision),
    Resolved(Incident),
    Ignored,
}

/// Feed one decoded helmet event to the router
pub async fn apply_event(router: &IncidentRouter, event: &HelmetEvent) -> Applied {
    let source_id = event.source_id();
    let channel = event.channel();

    match event.kind {
        HelmetEventKind::AccidentPending => {
            let outcome = router.report_pending(source_id, event.to_partial(), channel);
            match (outcome.incident, outcome.decision) {
                (Some(incident), _) => Applied::Opened(incident),
                (None, AdmitDecision::AlreadyPending) => Applied::Merged,
                (None, decision) => Applied::Suppressed(decision),
            }
        }
        HelmetEventKind::CrashConfirmed => {
            if router.open_incident(source_id).is_none() {
                // Confirmation without a pending report: open it first
                let outcome = router.report_pending(source_id, event.to_partial(), channel);
                if !confirmable(&outcome.decision) {
                    return Applied::Suppressed(outcome.decision);
                }
            } else {
                router.merge_telemetry(source_id, event.to_partial());
            }
            match router.confirm(source_id).await {
                SignalOutcome::Resolved(incident) => Applied::Resolved(incident),
                SignalOutcome::Ignored => Applied::Ignored,
            }
        }
        HelmetEventKind::CrashCancelled => match router.cancel(source_id).await {
            SignalOutcome::Resolved(incident) => Applied::Resolved(incident),
            SignalOutcome::Ignored => Applied::Ignored,
        },
        HelmetEventKind::Unknown => {
            warn!("Ignoring unknown helmet event from {}", source_id);
            Applied::Ignored
        }
    }
}

/// A confirmation resolves whatever is open for the source, including an
/// incident another channel opened since it was checked.
fn confirmable(decision: &AdmitDecision) -> bool {
    matches!(decision, AdmitDecision::Admitted | AdmitDecision::AlreadyPending)
}

/// Broker connection
pub struct MqttBridge {
    client: AsyncClient,
    config: MqttConfig,
}

impl MqttBridge {
    /// Create the client. Nothing is sent until the event loop is spawned.
    pub fn new(config: MqttConfig) -> Result<(Self, EventLoop), BridgeError> {
        config.validate()?;

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive());
        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);

        info!("MQTT bridge configured for {}:{}", config.host, config.port);
        Ok((Self { client, config }, eventloop))
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Spawn the broker loop, the inbound handler and the status republisher
    pub fn spawn(&self, eventloop: EventLoop, router: IncidentRouter) -> Vec<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        vec![
            tokio::spawn(poll_broker(
                eventloop,
                self.client.clone(),
                self.config.clone(),
                tx,
            )),
            tokio::spawn(handle_inbound(rx, router.clone())),
            tokio::spawn(republish_status(
                self.client.clone(),
                self.config.clone(),
                router.subscribe(),
            )),
        ]
    }
}

async fn poll_broker(
    mut eventloop: EventLoop,
    client: AsyncClient,
    config: MqttConfig,
    inbound: mpsc::Sender<Vec<u8>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker {}:{}", config.host, config.port);
                // Clean sessions drop subscriptions, so subscribe on every connect
                match client.try_subscribe(&config.event_topic, QoS::AtLeastOnce) {
                    Ok(()) => info!("Subscribed to {}", config.event_topic),
                    Err(e) => error!("Subscribe to {} failed: {}", config.event_topic, e),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("MQTT message on {}", publish.topic);
                if let Err(e) = inbound.try_send(publish.payload.to_vec()) {
                    warn!("Dropping helmet event from {}: {}", publish.topic, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(config.reconnect_delay()).await;
            }
        }
    }
}

async fn handle_inbound(mut rx: mpsc::Receiver<Vec<u8>>, router: IncidentRouter) {
    while let Some(payload) = rx.recv().await {
        let event = match HelmetEvent::parse(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping helmet event: {}", e);
                continue;
            }
        };
        info!("{:?} from {} via {}", event.kind, event.source_id(), event.channel().as_str());
        let applied = apply_event(&router, &event).await;
        debug!("Helmet event applied: {:?}", applied);
    }
}

async fn republish_status(client: AsyncClient, config: MqttConfig, mut events: broadcast::Receiver<RouterEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Status republisher lagged, {} events skipped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let message = StatusMessage::from_event(&event);
        let topic = config.status_topic_for(&message.helmet_id);
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode status message: {}", e);
                continue;
            }
        };
        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            warn!("Failed to publish status to {}: {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alerting::AlertingConfig;
    use crash_detection::ScorerConfig;
    use incident_router::{IncidentState, RouterConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use storage::{Channel, EscalationStatus, IncidentLog, Severity};

    use crate::dispatch::UnconfiguredDispatcher;
    use incident_router::{BoxFuture, DispatchError, Escalation, NotificationDispatcher};
    use tokio::time::Instant;

    fn router_with(dispatcher: Arc<dyn NotificationDispatcher>) -> IncidentRouter {
        IncidentRouter::new(
            ScorerConfig::default(),
            AlertingConfig::default(),
            RouterConfig::default(),
            Arc::new(IncidentLog::in_memory(100)),
            dispatcher,
        )
        .unwrap()
    }

    fn router() -> IncidentRouter {
        router_with(Arc::new(UnconfiguredDispatcher))
    }

    struct StalledDispatcher;

    impl NotificationDispatcher for StalledDispatcher {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn dispatch<'a>(&'a self, _escalation: &'a Escalation) -> BoxFuture<'a, Result<(), DispatchError>> {
            Box::pin(std::future::pending())
        }
    }

    async fn recorded(rx: &mut broadcast::Receiver<RouterEvent>) -> Incident {
        loop {
            if let RouterEvent::Recorded(incident) = rx.recv().await.unwrap() {
                return incident;
            }
        }
    }

    fn event(json: &str) -> HelmetEvent {
        HelmetEvent::parse(json.as_bytes()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_pending_then_cancel() {
        let router = router();

        let applied = apply_event(
            &router,
            &event(r#"{"type":"ACCIDENT_PENDING","helmetId":"H001","source":"ESP32","timestamp":5120}"#),
        )
        .await;
        let opened = match applied {
            Applied::Opened(incident) => incident,
            other => panic!("expected open, got {:?}", other),
        };
        assert_eq!(opened.channel, Channel::Esp32);

        // mobile leg of the same crash merges, with its GPS fix
        let applied = apply_event(
            &router,
            &event(
                r#"{"type":"ACCIDENT_PENDING","helmetId":"H001","source":"MOBILE","gForce":9.4,
                    "location":{"latitude":15.36,"longitude":75.12}}"#,
            ),
        )
        .await;
        assert_eq!(applied, Applied::Merged);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let applied = apply_event(
            &router,
            &event(r#"{"type":"CRASH_CANCELLED","helmetId":"H001","reason":"USER_OVERRIDE","source":"ESP32"}"#),
        )
        .await;
        match applied {
            Applied::Resolved(incident) => {
                assert_eq!(incident.id, opened.id);
                assert_eq!(incident.state, IncidentState::Cancelled);
                assert_eq!(incident.merged_telemetry.g_force, Some(9.4));
                assert!(incident.merged_telemetry.location.is_some());
            }
            other => panic!("expected resolution, got {:?}", other),
        }

        // duplicate cancel
        let applied = apply_event(&router, &event(r#"{"type":"CRASH_CANCELLED","helmetId":"H001"}"#)).await;
        assert_eq!(applied, Applied::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_confirmation_escalates() {
        let router = router();
        let mut rx = router.subscribe();
        apply_event(&router, &event(r#"{"type":"ACCIDENT_PENDING","helmetId":"H002","source":"ESP32"}"#)).await;

        let applied = apply_event(
            &router,
            &event(r#"{"type":"CRASH_CONFIRMED","helmetId":"H002","gForce":11.2,"tilt":70.0,"cancelWindow":"EXPIRED","source":"ESP32"}"#),
        )
        .await;
        let incident = match applied {
            Applied::Resolved(incident) => incident,
            other => panic!("expected resolution, got {:?}", other),
        };
        assert_eq!(incident.state, IncidentState::Confirmed);
        assert_eq!(incident.severity, Severity::High);
        assert_eq!(incident.merged_telemetry.g_force, Some(11.2));
        assert_eq!(incident.escalation, EscalationStatus::Pending);

        // no channel configured: attempted, not delivered
        let settled = recorded(&mut rx).await;
        assert_eq!(settled.id, incident.id);
        assert_eq!(settled.escalation, EscalationStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_without_pending_opens_and_resolves() {
        let router = router();
        let mut rx = router.subscribe();
        let applied = apply_event(
            &router,
            &event(r#"{"type":"CRASH_CONFIRMED","gForce":10.5,"source":"ESP32"}"#),
        )
        .await;
        match applied {
            Applied::Resolved(incident) => {
                assert_eq!(incident.source_id, "H001");
                assert_eq!(incident.state, IncidentState::Confirmed);
            }
            other => panic!("expected resolution, got {:?}", other),
        }
        recorded(&mut rx).await;
        assert_eq!(router.log().count().await.unwrap(), 1);

        // inside the cooldown window a second confirmation is suppressed
        let applied = apply_event(
            &router,
            &event(r#"{"type":"CRASH_CONFIRMED","gForce":10.5,"source":"ESP32"}"#),
        )
        .await;
        assert!(matches!(applied, Applied::Suppressed(AdmitDecision::CoolingDown { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_resolves_incident_opened_elsewhere() {
        let router = router();
        router.ingest(
            crash_detection::TelemetrySample::new("H003").with_g_force(10.0),
            Channel::Mobile,
        );

        let applied = apply_event(
            &router,
            &event(r#"{"type":"CRASH_CONFIRMED","helmetId":"H003","tilt":80.0,"source":"ESP32"}"#),
        )
        .await;
        match applied {
            Applied::Resolved(incident) => {
                assert_eq!(incident.state, IncidentState::Confirmed);
                assert_eq!(incident.channel, Channel::Mobile);
                assert_eq!(incident.merged_telemetry.tilt_deg, Some(80.0));
            }
            other => panic!("expected resolution, got {:?}", other),
        }

        // a racing open shows up as AlreadyPending and must still confirm
        assert!(confirmable(&AdmitDecision::AlreadyPending));
        assert!(confirmable(&AdmitDecision::Admitted));
        assert!(!confirmable(&AdmitDecision::NotDetected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_escalation_does_not_hold_other_helmets() {
        let router = router_with(Arc::new(StalledDispatcher));
        apply_event(&router, &event(r#"{"type":"ACCIDENT_PENDING","helmetId":"H001","source":"ESP32"}"#)).await;
        apply_event(&router, &event(r#"{"type":"ACCIDENT_PENDING","helmetId":"H002","source":"ESP32"}"#)).await;

        let before = Instant::now();
        let applied = apply_event(&router, &event(r#"{"type":"CRASH_CONFIRMED","helmetId":"H001"}"#)).await;
        assert!(matches!(applied, Applied::Resolved(_)));

        let applied = apply_event(&router, &event(r#"{"type":"CRASH_CANCELLED","helmetId":"H002"}"#)).await;
        match applied {
            Applied::Resolved(incident) => assert_eq!(incident.state, IncidentState::Cancelled),
            other => panic!("expected resolution, got {:?}", other),
        }
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_event_ignored() {
        let router = router();
        let applied = apply_event(&router, &event(r#"{"type":"HEARTBEAT","helmetId":"H001"}"#)).await;
        assert_eq!(applied, Applied::Ignored);
        assert_eq!(router.open_count(), 0);
    }

    #[test]
    fn test_status_message_shape() {
        let router_event = RouterEvent::Pending(
            serde_json::from_value(serde_json::json!({
                "id": "i-1",
                "sourceId": "H001",
                "state": "PENDING",
                "mergedTelemetry": {"gForce": 10.0, "tilt": null, "acceleration": null, "location": null, "updates": 1},
                "createdAt": "2024-06-10T08:00:00Z",
                "resolvedAt": null,
                "severity": "NONE",
                "channel": "ESP32",
                "confidence": 1.0,
                "reason": "HARD_IMPACT",
                "escalation": "NOT_REQUIRED",
                "countdownSecs": 10
            }))
            .unwrap(),
        );
        let message = StatusMessage::from_event(&router_event);
        assert_eq!(message.kind, "INCIDENT_PENDING");
        assert_eq!(message.countdown, Some(10));

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "INCIDENT_PENDING");
        assert_eq!(value["helmetId"], "H001");
        assert_eq!(value["state"], "PENDING");
    }
}
