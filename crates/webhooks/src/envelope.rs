//! Outbound request body.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContentType;
use crate::error::WebhookError;

/// `{event, timestamp, data}` as delivered to the callback URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    /// ISO-8601, UTC.
    pub timestamp: String,
    pub data: serde_json::Value,
    /// Identifier of the originating business event, when the producer supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            event: event_type.into(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
            event_id: None,
        }
    }

    pub fn with_event_id(mut self, event_id: Option<String>) -> Self {
        self.event_id = event_id;
        self
    }

    /// Serialize to the body that will be signed and sent.
    ///
    /// Form bodies carry `data` as a JSON string field.
    pub fn encode(&self, content_type: ContentType) -> Result<String, WebhookError> {
        match content_type {
            ContentType::Json => {
                serde_json::to_string(self).map_err(|e| WebhookError::Serialization(e.to_string()))
            }
            ContentType::FormUrlEncoded => {
                let data = serde_json::to_string(&self.data)
                    .map_err(|e| WebhookError::Serialization(e.to_string()))?;
                let mut form = url::form_urlencoded::Serializer::new(String::new());
                form.append_pair("event", &self.event)
                    .append_pair("timestamp", &self.timestamp)
                    .append_pair("data", &data);
                if let Some(event_id) = &self.event_id {
                    form.append_pair("event_id", event_id);
                }
                Ok(form.finish())
            }
        }
    }
}
