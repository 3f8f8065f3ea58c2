//! Escalation dispatchers

use incident_router::{BoxFuture, DispatchError, Escalation, NotificationDispatcher};
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bridge::MqttBridge;
use crate::config::{NotifyChannel, NotifyConfig};
use crate::email::EmailDispatcher;
use crate::BridgeError;

/// Publishes escalations to `helmet/{id}/alert`
pub struct MqttDispatcher {
    client: AsyncClient,
    alert_topic: String,
}

impl MqttDispatcher {
    /// `alert_topic` is a template containing `{id}`
    pub fn new(client: AsyncClient, alert_topic: impl Into<String>) -> Self {
        Self {
            client,
            alert_topic: alert_topic.into(),
        }
    }
}

impl NotificationDispatcher for MqttDispatcher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn dispatch<'a>(&'a self, escalation: &'a Escalation) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            let payload =
                serde_json::to_vec(escalation).map_err(|e| DispatchError::Delivery(e.to_string()))?;
            let topic = self.alert_topic.replace("{id}", &escalation.source_id);

            self.client
                .publish(&topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| DispatchError::Delivery(e.to_string()))?;

            info!("Escalation {} published to {}", escalation.incident_id, topic);
            Ok(())
        })
    }
}

/// POSTs escalations as JSON to a fixed URL
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl NotificationDispatcher for WebhookDispatcher {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn dispatch<'a>(&'a self, escalation: &'a Escalation) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            self.client
                .post(&self.url)
                .json(escalation)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|e| DispatchError::Delivery(e.to_string()))?;
            Ok(())
        })
    }
}

/// Stand-in when no delivery channel is configured. Always fails, so the
/// incident record shows the escalation was attempted but not delivered.
pub struct UnconfiguredDispatcher;

impl NotificationDispatcher for UnconfiguredDispatcher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn dispatch<'a>(&'a self, escalation: &'a Escalation) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            warn!(
                "Escalation {} for {} not sent: no delivery channel configured",
                escalation.incident_id, escalation.source_id
            );
            Err(DispatchError::NotConfigured)
        })
    }
}

/// Pick the dispatcher for the configured channel
pub fn build_dispatcher(
    notify: &NotifyConfig,
    bridge: Option<&MqttBridge>,
) -> Result<Arc<dyn NotificationDispatcher>, BridgeError> {
    match notify.channel {
        NotifyChannel::None => Ok(Arc::new(UnconfiguredDispatcher)),
        NotifyChannel::Mqtt => {
            let bridge = bridge.ok_or_else(|| {
                BridgeError::Config("notify.channel = \"mqtt\" requires mqtt.enabled".to_string())
            })?;
            Ok(Arc::new(MqttDispatcher::new(
                bridge.client().clone(),
                bridge.config().alert_topic.clone(),
            )))
        }
        NotifyChannel::Webhook => {
            let url = notify
                .webhook_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| {
                    BridgeError::Config("notify.webhook_url is required for the webhook channel".to_string())
                })?;
            Ok(Arc::new(WebhookDispatcher::new(url, notify.webhook_timeout())?))
        }
        NotifyChannel::Email => {
            if notify.email.credentials().is_none() {
                warn!("Email credentials not configured, escalations will not be sent");
                return Ok(Arc::new(UnconfiguredDispatcher));
            }
            Ok(Arc::new(EmailDispatcher::smtp(&notify.email)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use storage::Channel;

    fn escalation() -> Escalation {
        Escalation {
            incident_id: "i-1".to_string(),
            source_id: "H001".to_string(),
            status: "No response from user - Emergency!".to_string(),
            g_force: 10.0,
            tilt: 5.0,
            location: None,
            channel: Channel::Mobile,
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_always_fails() {
        let dispatcher = UnconfiguredDispatcher;
        let result = dispatcher.dispatch(&escalation()).await;
        assert_eq!(result, Err(DispatchError::NotConfigured));
        assert_eq!(
            DispatchError::NotConfigured.to_string(),
            "No delivery channel configured"
        );
    }

    #[test]
    fn test_build_default_is_unconfigured() {
        let dispatcher = build_dispatcher(&NotifyConfig::default(), None).unwrap();
        assert_eq!(dispatcher.name(), "none");
    }

    #[test]
    fn test_mqtt_channel_requires_bridge() {
        let notify = NotifyConfig {
            channel: NotifyChannel::Mqtt,
            ..Default::default()
        };
        assert!(matches!(
            build_dispatcher(&notify, None),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_webhook_requires_url() {
        let notify = NotifyConfig {
            channel: NotifyChannel::Webhook,
            ..Default::default()
        };
        assert!(build_dispatcher(&notify, None).is_err());

        let notify = NotifyConfig {
            channel: NotifyChannel::Webhook,
            webhook_url: Some("http://127.0.0.1:9/hook".to_string()),
            ..Default::default()
        };
        assert_eq!(build_dispatcher(&notify, None).unwrap().name(), "webhook");
    }

    #[tokio::test]
    async fn test_email_channel() {
        let mut notify = NotifyConfig {
            channel: NotifyChannel::Email,
            ..Default::default()
        };
        notify.email.to = vec!["contact@example.com".to_string()];
        assert_eq!(build_dispatcher(&notify, None).unwrap().name(), "none");

        notify.email.username = Some("relay@example.com".to_string());
        notify.email.password = Some("app-password".to_string());
        assert_eq!(build_dispatcher(&notify, None).unwrap().name(), "email");

        notify.email.to.clear();
        assert!(matches!(
            build_dispatcher(&notify, None),
            Err(BridgeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_delivery_error() {
        let dispatcher =
            WebhookDispatcher::new("http://127.0.0.1:9/hook", std::time::Duration::from_secs(2)).unwrap();
        let result = dispatcher.dispatch(&escalation()).await;
        assert!(matches!(result, Err(DispatchError::Delivery(_))));
    }
}
