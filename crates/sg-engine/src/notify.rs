//! Status notification sinks.
//!
//! Generation never depends on a notification being delivered: the
//! [`Notifier`] logs sink failures and carries on.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use sg_types::{internal_error, secs_to_duration, NotificationConfig, SgResult};

use crate::progress::ProgressSnapshot;

/// A titled list of key/value status fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub title: String,
    pub fields: Vec<(String, String)>,
}

impl StatusReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    pub fn from_snapshot(snapshot: &ProgressSnapshot) -> Self {
        Self {
            title: "Data generation progress:".to_string(),
            fields: snapshot.status_fields(),
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Slack-style markdown body, one `*key*: value` line per field.
    pub fn to_markdown(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("*{k}*: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Destination for status reports.
pub trait StatusSink: Send {
    fn name(&self) -> &str;

    fn send(&self, report: &StatusReport) -> SgResult<()>;
}

/// Writes reports to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, report: &StatusReport) -> SgResult<()> {
        let body = report
            .fields
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!("{} {}", report.title, body);
        Ok(())
    }
}

/// Posts reports to a Slack-compatible incoming webhook.
///
/// Uses a blocking client; construct it outside of an async runtime.
#[derive(Debug)]
pub struct WebhookSink {
    pub url: String,
    pub client: reqwest::blocking::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> SgResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| internal_error!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    fn payload(report: &StatusReport) -> serde_json::Value {
        serde_json::json!({
            "text": report.title,
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": report.title }
                },
                {
                    "type": "context",
                    "elements": [ { "type": "mrkdwn", "text": report.to_markdown() } ]
                }
            ]
        })
    }
}

impl StatusSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, report: &StatusReport) -> SgResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(report))
            .send()
            .map_err(|e| internal_error!("HTTP request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(internal_error!("HTTP error: {}", response.status()));
        }
        Ok(())
    }
}

/// Forwards reports over a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<StatusReport>,
}

impl ChannelSink {
    pub fn new(tx: Sender<StatusReport>) -> Self {
        Self { tx }
    }
}

impl StatusSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    fn send(&self, report: &StatusReport) -> SgResult<()> {
        self.tx
            .try_send(report.clone())
            .map_err(|e| internal_error!("Status channel unavailable: {}", e))
    }
}

/// Interval-gated fan-out to a set of sinks.
pub struct Notifier {
    sinks: Vec<Box<dyn StatusSink>>,
    interval: Duration,
    last_sent: Option<Instant>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("interval", &self.interval)
            .finish()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Notifier {
    /// A notifier without sinks; every send is a no-op.
    pub fn disabled() -> Self {
        Self {
            sinks: Vec::new(),
            interval: Duration::ZERO,
            last_sent: None,
        }
    }

    /// Send at most once per `interval`, counted from the first
    /// [`maybe_notify`](Self::maybe_notify) call.
    pub fn new(interval: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            interval,
            last_sent: None,
        }
    }

    /// Build a notifier from configuration. Remote notifications need both
    /// `enabled` and a positive interval.
    pub fn from_config(config: &NotificationConfig, interval_secs: f64) -> SgResult<Self> {
        let url = match (&config.webhook_url, config.enabled && interval_secs > 0.0) {
            (Some(url), true) => url,
            _ => return Ok(Self::disabled()),
        };
        Ok(Self::new(secs_to_duration(interval_secs)).with_sink(Box::new(WebhookSink::new(url.as_str())?)))
    }

    pub fn with_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Deliver `report` if the interval has passed. Returns whether it was sent.
    pub fn maybe_notify(&mut self, report: &StatusReport) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let now = Instant::now();
        match self.last_sent {
            None if !self.interval.is_zero() => {
                self.last_sent = Some(now);
                return false;
            }
            Some(last) if now.duration_since(last) < self.interval => return false,
            _ => {}
        }

        self.last_sent = Some(now);
        self.notify_now(report);
        true
    }

    /// Deliver `report` to every sink immediately.
    pub fn notify_now(&self, report: &StatusReport) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(report) {
                tracing::warn!("Status notification via {} failed: {}", sink.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    struct FailingSink;

    impl StatusSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn send(&self, _report: &StatusReport) -> SgResult<()> {
            Err(internal_error!("unreachable host"))
        }
    }

    #[test]
    fn test_channel_sink_receives_reports() {
        let (tx, rx) = unbounded();
        let mut notifier = Notifier::new(Duration::ZERO).with_sink(Box::new(ChannelSink::new(tx)));

        let report = StatusReport::new("Data generation progress:").with_field("Dataset", "eye");
        assert!(notifier.maybe_notify(&report));
        assert!(notifier.maybe_notify(&report));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.field("Dataset"), Some("eye"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_interval_gating() {
        let (tx, rx) = unbounded();
        let mut notifier =
            Notifier::new(Duration::from_secs(3600)).with_sink(Box::new(ChannelSink::new(tx)));

        let report = StatusReport::new("x");
        assert!(!notifier.maybe_notify(&report));
        assert!(!notifier.maybe_notify(&report));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failures_are_swallowed() {
        let (tx, rx) = unbounded();
        let mut notifier = Notifier::new(Duration::ZERO)
            .with_sink(Box::new(FailingSink))
            .with_sink(Box::new(ChannelSink::new(tx)));

        assert!(notifier.maybe_notify(&StatusReport::new("x")));
        // the channel sink still got the report
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_disabled_by_config() {
        let config = NotificationConfig::default();
        let notifier = Notifier::from_config(&config, 60.0).unwrap();
        assert!(!notifier.is_enabled());

        let config = NotificationConfig {
            enabled: true,
            webhook_url: Some("http://localhost:9/hook".to_string()),
        };
        assert!(!Notifier::from_config(&config, 0.0).unwrap().is_enabled());
    }

    #[test]
    fn test_markdown_body() {
        let report = StatusReport::new("t").with_field("Samples", "1/2").with_field("Errors", 0);
        assert_eq!(report.to_markdown(), "*Samples*: 1/2\n*Errors*: 0");
        let payload = WebhookSink::payload(&report);
        assert_eq!(payload["blocks"][0]["text"]["text"], "t");
    }
}
