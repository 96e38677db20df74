//! Delivers events to the HTTP sink.
//!
//! One POST per event, no retries: a failed send is reported to the relay,
//! which backs the message out and lets the queue redeliver it.

use crate::config::{ContentMode, RelayConfig};
use crate::envelope::{StructuredEvent, SPEC_VERSION};
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Content type of binary-mode bodies.
const DATA_CONTENT_TYPE: &str = "application/octet-stream";
/// Content type of structured-mode bodies.
const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";
/// Longest sink response body kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// Destination for relayed events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Send one event. `Ok` means the sink acknowledged it.
    async fn send(&self, event: &StructuredEvent) -> RelayResult<()>;
}

/// Structured-mode CloudEvents document.
#[derive(Debug, Serialize)]
struct StructuredBody<'a> {
    specversion: &'static str,
    id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    source: &'a str,
    time: String,
    datacontenttype: &'static str,
    data_base64: String,
}

impl<'a> StructuredBody<'a> {
    fn new(event: &'a StructuredEvent, time: DateTime<Utc>) -> Self {
        Self {
            specversion: SPEC_VERSION,
            id: &event.id,
            event_type: &event.event_type,
            source: &event.source,
            time: time.to_rfc3339_opts(SecondsFormat::Millis, true),
            datacontenttype: DATA_CONTENT_TYPE,
            data_base64: BASE64.encode(&event.data),
        }
    }
}

/// CloudEvents-over-HTTP sink.
#[derive(Clone)]
pub struct HttpSink {
    client: Client,
    url: String,
    mode: ContentMode,
}

impl HttpSink {
    /// Create a sink posting to `url`.
    pub fn new(url: impl Into<String>, mode: ContentMode, timeout: Duration) -> RelayResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
            mode,
        })
    }

    pub fn from_config(config: &RelayConfig) -> RelayResult<Self> {
        let url = config.sink_url()?;
        Self::new(url.as_str(), config.content_mode, config.sink_timeout)
    }

    /// The URL events are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, event: &StructuredEvent) -> RelayResult<reqwest::RequestBuilder> {
        let now = Utc::now();
        let request = self.client.post(&self.url);

        let request = match self.mode {
            ContentMode::Binary => request
                .header("ce-specversion", SPEC_VERSION)
                .header("ce-id", &event.id)
                .header("ce-type", &event.event_type)
                .header("ce-source", &event.source)
                .header("ce-time", now.to_rfc3339_opts(SecondsFormat::Millis, true))
                .header("Content-Type", DATA_CONTENT_TYPE)
                .body(event.data.clone()),
            ContentMode::Structured => {
                let body = serde_json::to_vec(&StructuredBody::new(event, now))?;
                request
                    .header("Content-Type", STRUCTURED_CONTENT_TYPE)
                    .body(body)
            }
        };

        Ok(request)
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn send(&self, event: &StructuredEvent) -> RelayResult<()> {
        debug!(
            url = %self.url,
            event_id = %event.id,
            data_len = event.data.len(),
            "Sending event"
        );

        let response = self.request(event)?.send().await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(RelayError::Sink {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> StructuredEvent {
        StructuredEvent {
            id: "abc".to_string(),
            event_type: "dev.triggermesh.eventing.ibm-mq".to_string(),
            source: "localhost(1414)".to_string(),
            data: vec![0, 1, 2, 254, 255],
        }
    }

    #[test]
    fn test_structured_body_encoding() {
        let event = event();
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let json = serde_json::to_value(StructuredBody::new(&event, time)).unwrap();

        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["type"], "dev.triggermesh.eventing.ibm-mq");
        assert_eq!(json["source"], "localhost(1414)");
        assert_eq!(json["time"], "2024-05-01T12:00:00.000Z");
        assert_eq!(json["datacontenttype"], "application/octet-stream");

        let decoded = BASE64.decode(json["data_base64"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, event.data);
    }

    #[test]
    fn test_binary_request_headers() {
        let sink = HttpSink::new(
            "http://localhost:8080",
            ContentMode::Binary,
            Duration::from_secs(1),
        )
        .unwrap();

        let request = sink.request(&event()).unwrap().build().unwrap();
        let headers = request.headers();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(headers["ce-specversion"], "1.0");
        assert_eq!(headers["ce-id"], "abc");
        assert_eq!(headers["ce-type"], "dev.triggermesh.eventing.ibm-mq");
        assert_eq!(headers["ce-source"], "localhost(1414)");
        assert!(headers.contains_key("ce-time"));
        assert_eq!(headers["content-type"], "application/octet-stream");
        assert_eq!(
            request.body().and_then(|b| b.as_bytes()),
            Some(&[0u8, 1, 2, 254, 255][..])
        );
    }

    #[test]
    fn test_from_config_rejects_bad_sink() {
        let config = RelayConfig {
            sink: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpSink::from_config(&config),
            Err(RelayError::Config(_))
        ));
    }
}
