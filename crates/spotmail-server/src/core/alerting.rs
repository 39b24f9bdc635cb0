use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use spotmail_proto::{Payload, TemplateName};
use tracing::{error, info, warn};

use super::clock::{Clock, rfc3339};
use super::mailer::{Mailer, OutboundMessage};
use super::templates::render;

/// Tracing target for everything the alerter emits, so operators can route
/// alert failures separately.
pub const ALERT_TARGET: &str = "spotmail::alerting";

#[derive(Debug, Clone)]
pub struct FailureContext<'a> {
    pub source: &'a str,
    pub error: String,
}

/// Best-effort admin notification. Never returns an error; anything that
/// keeps an alert from going out is logged and counted instead.
pub struct AdminAlerter {
    mailer: Arc<Mailer>,
    admin_email: Option<String>,
    clock: Arc<dyn Clock>,
    dropped: AtomicU64,
}

impl AdminAlerter {
    pub fn new(
        mailer: Arc<Mailer>,
        admin_email: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { mailer, admin_email, clock, dropped: AtomicU64::new(0) }
    }

    pub fn dropped_alerts(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn notify_failure(
        &self,
        context: &FailureContext<'_>,
    ) {
        error!(
            target: ALERT_TARGET,
            "email processing failed: source={}, error={}", context.source, context.error
        );

        let Some(admin_email) = self.admin_email.as_ref() else {
            self.drop_alert("admin email not configured");
            return;
        };

        let mut payload = Payload::new();
        payload.insert("context".into(), Value::String(context.source.to_string()));
        payload.insert("error".into(), Value::String(context.error.clone()));
        payload.insert("timestamp".into(), Value::String(rfc3339(self.clock.now())));

        let rendered = match render(TemplateName::AdminAlert, &payload) {
            Ok(rendered) => rendered,
            Err(err) => {
                self.drop_alert(&err.to_string());
                return;
            }
        };

        let outbound = OutboundMessage::from_rendered(vec![admin_email.clone()], rendered);
        match self.mailer.send(&outbound).await {
            Ok(delivery) => info!(
                target: ALERT_TARGET,
                "admin alert sent: source={}, message_id={}", context.source, delivery.message_id
            ),
            Err(err) => self.drop_alert(&err.to_string()),
        }
    }

    fn drop_alert(
        &self,
        reason: &str,
    ) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: ALERT_TARGET,
            "admin alert dropped: reason={}, dropped_total={}", reason, total
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::mailer::DispatchError;
    use crate::core::mailer::testing::{RecordingTransport, sender};

    fn alerter(
        admin: Option<&str>,
        transport: Arc<RecordingTransport>,
    ) -> AdminAlerter {
        let mailer = Arc::new(Mailer::new(sender(), transport, None, None));
        AdminAlerter::new(
            mailer,
            admin.map(str::to_string),
            Arc::new(ManualClock::default()),
        )
    }

    fn context() -> FailureContext<'static> {
        FailureContext { source: "cron", error: "job store failed: pool timed out".into() }
    }

    #[tokio::test]
    async fn alert_is_rendered_and_sent_to_admin() {
        let transport = Arc::new(RecordingTransport::default());
        let alerter = alerter(Some("ops@spotitfor.me"), transport.clone());

        alerter.notify_failure(&context()).await;

        let raw = transport.sent().remove(0);
        assert!(raw.contains("To: ops@spotitfor.me"));
        assert!(raw.contains("[SpotItForMe] cron failed"));
        assert!(raw.contains("2025-06-01T12:00:00Z"));
        assert_eq!(alerter.dropped_alerts(), 0);
    }

    #[tokio::test]
    async fn missing_admin_address_is_counted_not_raised() {
        let transport = Arc::new(RecordingTransport::default());
        let alerter = alerter(None, transport.clone());

        alerter.notify_failure(&context()).await;

        assert_eq!(transport.calls(), 0);
        assert_eq!(alerter.dropped_alerts(), 1);
    }

    #[tokio::test]
    async fn failing_send_is_swallowed_and_counted() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_next([DispatchError::Unknown("connection refused".into())]);
        let alerter = alerter(Some("ops@spotitfor.me"), transport.clone());

        alerter.notify_failure(&context()).await;
        alerter.notify_failure(&context()).await;

        assert_eq!(transport.calls(), 2);
        assert_eq!(alerter.dropped_alerts(), 1);
    }

    #[tokio::test]
    async fn unconfigured_mailer_drops_alert() {
        let transport = Arc::new(RecordingTransport::default());
        let mailer = Arc::new(Mailer::new(None, transport.clone(), None, None));
        let alerter = AdminAlerter::new(
            mailer,
            Some("ops@spotitfor.me".into()),
            Arc::new(ManualClock::default()),
        );

        alerter.notify_failure(&context()).await;

        assert_eq!(transport.calls(), 0);
        assert_eq!(alerter.dropped_alerts(), 1);
    }
}
