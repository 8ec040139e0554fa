//! Outbound notifications.
//!
//! Lifecycle events are posted to a configurable webhook. Delivery is best
//! effort: failures are logged and never bubble into the request that
//! produced the event.

use std::time::Duration;

use crate::booking::BookingEvent;

#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    /// Deliver a single event. Returns whether delivery succeeded so the
    /// sweeper can count failures; online callers ignore the result.
    pub async fn notify(&self, event: &BookingEvent) -> bool {
        let Some(url) = &self.webhook_url else {
            tracing::debug!(?event, "notification webhook not configured, dropping event");
            return true;
        };

        match self.client.post(url).json(event).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(?event, "notification delivered");
                true
            }
            Ok(resp) => {
                tracing::warn!(?event, status = %resp.status(), "notification rejected");
                false
            }
            Err(err) => {
                tracing::warn!(?event, error = %err, "notification delivery failed");
                false
            }
        }
    }

    /// Fire-and-forget delivery of a batch of events.
    pub fn dispatch(&self, events: Vec<BookingEvent>) {
        if events.is_empty() {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            for event in &events {
                notifier.notify(event).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_bounded_timeout() {
        assert!(Notifier::new(None).is_ok());
    }
}
