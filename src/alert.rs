use reqwest::Client;
use serde_json::json;

/// One-way webhook notifier used for threshold alarms. Generalizes
/// `bin/sentinel`'s `Notifier` (which posted to two hardcoded webhook
/// kinds) down to a single generic `WEBHOOK_URL`; failures are swallowed
/// and logged, never promoted to loop errors.
#[derive(Clone)]
pub struct AlertSink {
    client: Client,
    webhook_url: String,
}

impl AlertSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        AlertSink { client: Client::new(), webhook_url: webhook_url.into() }
    }

    /// Posts `message` to `WEBHOOK_URL`, best-effort. A missing/empty URL
    /// is treated as "alerting disabled".
    pub async fn notify(&self, message: &str) {
        if self.webhook_url.is_empty() {
            return;
        }
        let payload = json!({ "text": message });
        if let Err(e) = self.client.post(&self.webhook_url).json(&payload).send().await {
            log::warn!("failed to deliver webhook alert: {e:?}");
        }
    }

    /// Checks dispatch wall time against the configured alarm thresholds.
    pub async fn check_dispatch_duration(&self, elapsed_secs: f64, lower: f64, upper: f64) {
        if elapsed_secs < lower {
            self.notify(&format!(
                "verifier dispatch took {elapsed_secs:.2}s, which is too quick (< {lower}s)"
            ))
            .await;
        }
        if elapsed_secs > upper {
            self.notify(&format!(
                "verifier dispatch took {elapsed_secs:.2}s, which is too long (> {upper}s)"
            ))
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_webhook_url_is_a_silent_noop() {
        let sink = AlertSink::new("");
        sink.notify("should not panic or send").await;
    }
}
