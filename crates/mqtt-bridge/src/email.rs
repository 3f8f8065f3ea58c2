//! SMTP escalation delivery

use incident_router::{BoxFuture, DispatchError, Escalation, NotificationDispatcher};
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::EmailConfig;
use crate::BridgeError;

const SUBJECT: &str = "HIGH SEVERITY CRASH: Emergency Alert";

/// Mails escalations to the configured emergency contacts
pub struct EmailDispatcher<T = AsyncSmtpTransport<Tokio1Executor>> {
    transport: T,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailDispatcher {
    /// Implicit-TLS SMTP relay with the configured credentials
    pub fn smtp(config: &EmailConfig) -> Result<Self, BridgeError> {
        let (username, password) = config.credentials().ok_or_else(|| {
            BridgeError::Config("notify.email.username and password are required".to_string())
        })?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .timeout(Some(config.timeout()))
            .build();
        Self::with_transport(transport, config)
    }
}

impl<T> EmailDispatcher<T> {
    pub fn with_transport(transport: T, config: &EmailConfig) -> Result<Self, BridgeError> {
        let from = parse_mailbox(&config.from)?;
        let to = config
            .to
            .iter()
            .map(|addr| parse_mailbox(addr))
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(BridgeError::Config("notify.email.to has no recipients".to_string()));
        }
        Ok(Self { transport, from, to })
    }

    fn compose(&self, escalation: &Escalation) -> Result<Message, DispatchError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(SUBJECT);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(render_body(escalation))
            .map_err(|e| DispatchError::Delivery(e.to_string()))
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, BridgeError> {
    addr.parse()
        .map_err(|e| BridgeError::Config(format!("invalid mailbox {:?}: {}", addr, e)))
}

fn detected_by(escalation: &Escalation) -> &'static str {
    match escalation.channel {
        storage::Channel::Esp32 => "Smart Helmet (ESP32)",
        storage::Channel::Mobile => "Mobile App",
        storage::Channel::Dashboard => "Dashboard",
        storage::Channel::Mqtt | storage::Channel::Other => "Relay",
    }
}

fn render_body(escalation: &Escalation) -> String {
    let mut body = format!(
        "HIGH SEVERITY CRASH DETECTED\n\
         \n\
         A high-impact crash was detected and the rider did not respond.\n\
         Immediate action required.\n\
         \n\
         Helmet:       {}\n\
         Status:       {}\n\
         Time (UTC):   {}\n\
         Impact force: {:.2} G\n\
         Helmet tilt:  {:.1} deg\n\
         Detected by:  {}\n\
         Incident:     {}\n\
         \n",
        escalation.source_id,
        escalation.status,
        escalation.detected_at.format("%Y-%m-%d %H:%M:%S"),
        escalation.g_force,
        escalation.tilt.abs(),
        detected_by(escalation),
        escalation.incident_id,
    );
    match (escalation.location, escalation.maps_link()) {
        (Some(location), Some(link)) => body.push_str(&format!(
            "Latitude:     {:.6}\nLongitude:    {:.6}\nMap:          {}\n",
            location.latitude, location.longitude, link
        )),
        _ => body.push_str("Location unavailable\n"),
    }
    body
}

impl<T> NotificationDispatcher for EmailDispatcher<T>
where
    T: AsyncTransport + Send + Sync + 'static,
    T::Error: std::fmt::Display,
{
    fn name(&self) -> &'static str {
        "email"
    }

    fn dispatch<'a>(&'a self, escalation: &'a Escalation) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            let message = self.compose(escalation)?;
            self.transport
                .send(message)
                .await
                .map_err(|e| DispatchError::Delivery(e.to_string()))?;

            info!(
                "Escalation {} mailed to {} recipient(s)",
                escalation.incident_id,
                self.to.len()
            );
            Ok(())
        })
    }
}
