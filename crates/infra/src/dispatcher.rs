//! Event fan-out and the single-attempt delivery logic.
//!
//! Per matching configuration the dispatcher serializes the envelope once,
//! stores that exact body on a new PENDING delivery log entry, signs it and
//! POSTs it. Retries resend the stored body byte-for-byte, so the signature
//! is stable across attempts while the timestamp header is fresh.
//!
//! Failures are isolated per configuration: nothing that goes wrong while
//! delivering to one endpoint stops delivery to its siblings, and attempt
//! errors end up in the delivery log instead of being returned.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use cmis_core::OrgId;
use cmis_webhooks::catalog::TEST_EVENT_TYPE;
use cmis_webhooks::delivery::truncate_body;
use cmis_webhooks::protocol::{
    EVENT_HEADER, RETRY_ATTEMPT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use cmis_webhooks::{
    AttemptOutcome, ContentType, DeliveryAttempt, DeliveryLogEntry, DeliveryStatus, Envelope,
    RetryPolicy, WebhookConfig, WebhookError, signer,
};

use crate::clock::Clock;
use crate::error::{ServiceError, ServiceResult, StoreError};
use crate::settings::{DEFAULT_RESPONSE_BODY_LIMIT, DeliverySettings};
use crate::store::WebhookStore;
use crate::transport::{HttpTransport, OutboundRequest};

/// Request-building knobs shared by every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    pub user_agent: String,
    pub response_body_limit: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            user_agent: cmis_webhooks::protocol::DEFAULT_USER_AGENT.to_string(),
            response_body_limit: DEFAULT_RESPONSE_BODY_LIMIT,
        }
    }
}

impl DispatchOptions {
    /// Response bytes read per attempt: enough for `response_body_limit`
    /// characters of any width.
    pub fn response_read_limit(&self) -> usize {
        self.response_body_limit.saturating_mul(4).max(1)
    }
}

impl From<&DeliverySettings> for DispatchOptions {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            user_agent: settings.user_agent.clone(),
            response_body_limit: settings.response_body_limit,
        }
    }
}

/// A business event handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Upstream platform the event originated from, if any.
    pub platform: Option<String>,
    pub source_event_id: Option<String>,
}

impl OutboundEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            platform: None,
            source_event_id: None,
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_source_event_id(mut self, source_event_id: impl Into<String>) -> Self {
        self.source_event_id = Some(source_event_id.into());
        self
    }
}

/// Result of a reachability test. Nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub success: bool,
    pub message: String,
    pub response_status: Option<u16>,
    pub response_time_ms: Option<u64>,
}

#[derive(Clone)]
pub struct Dispatcher<S, T> {
    store: S,
    transport: T,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    options: DispatchOptions,
}

impl<S: WebhookStore, T: HttpTransport> Dispatcher<S, T> {
    pub fn new(store: S, transport: T, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            store,
            transport,
            clock,
            policy,
            options: DispatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fan `event` out to every active, verified configuration of `org_id`
    /// that subscribes to it.
    ///
    /// Returns how many configurations were triggered (a delivery log entry
    /// was created), whatever the outcome of their first attempt. Only the
    /// initial configuration lookup can fail.
    pub async fn forward_event(
        &self,
        org_id: OrgId,
        event: &OutboundEvent,
    ) -> Result<usize, StoreError> {
        let configs = self.store.find_deliverable(org_id).await?;
        let mut triggered = 0;

        let platform = event.platform.as_deref();
        for config in configs
            .iter()
            .filter(|c| c.can_deliver() && c.accepts(&event.event_type, platform))
        {
            match self.open_delivery(config, event).await {
                Ok(entry) => {
                    triggered += 1;
                    self.attempt(entry, config).await;
                }
                Err(e) => {
                    error!(
                        target: "webhook_delivery",
                        org_id = %org_id,
                        webhook_config_id = %config.id,
                        event_type = %event.event_type,
                        error = %e,
                        "failed to create delivery"
                    );
                }
            }
        }

        info!(
            target: "webhook_delivery",
            org_id = %org_id,
            event_type = %event.event_type,
            candidates = configs.len(),
            triggered,
            "event forwarded to webhooks"
        );
        Ok(triggered)
    }

    /// Deliver `event` to one configuration, skipping subscription matching.
    ///
    /// Returns the delivery log entry as it stands after the first attempt.
    pub async fn deliver_to_endpoint(
        &self,
        config: &WebhookConfig,
        event: &OutboundEvent,
    ) -> ServiceResult<DeliveryLogEntry> {
        if !config.can_deliver() {
            return Err(ServiceError::NotDeliverable(config.id));
        }
        let entry = self.open_delivery(config, event).await?;
        Ok(self.attempt(entry, config).await)
    }

    /// Start a fresh delivery that re-sends the payload of a FAILED entry.
    pub async fn resend(
        &self,
        failed: &DeliveryLogEntry,
        config: &WebhookConfig,
    ) -> ServiceResult<DeliveryLogEntry> {
        if !config.can_deliver() {
            return Err(ServiceError::NotDeliverable(config.id));
        }
        let now = self.clock.now();
        let entry = DeliveryLogEntry::resend_of(failed, config, self.policy.max_attempts, now)?;
        self.store.insert_delivery(&entry).await?;
        self.touch_triggered(config, now).await;

        info!(
            target: "webhook_delivery",
            org_id = %config.org_id,
            webhook_config_id = %config.id,
            delivery_id = %entry.id,
            retry_of = %failed.id,
            "manual resend of failed delivery"
        );
        Ok(self.attempt(entry, config).await)
    }

    /// POST a synthetic signed event to check reachability. No delivery log
    /// entry and no health telemetry are written.
    pub async fn test_webhook(&self, config: &WebhookConfig) -> ServiceResult<TestResult> {
        if !config.is_verified {
            return Err(WebhookError::NotVerified.into());
        }

        let now = self.clock.now();
        let body = Envelope::new(
            TEST_EVENT_TYPE,
            json!({
                "message": "This is a test webhook delivery",
                "webhook_id": config.id,
                "test": true,
            }),
            now,
        )
        .encode(config.content_type)?;
        let request =
            self.signed_request(config, TEST_EVENT_TYPE, config.content_type, body, 1, now)?;
        let outcome = self.send(request).await;

        let result = if outcome.is_success() {
            TestResult {
                success: true,
                message: "test webhook delivered".to_string(),
                response_status: outcome.response_status,
                response_time_ms: outcome.response_time_ms,
            }
        } else {
            TestResult {
                success: false,
                message: outcome.failure_reason(),
                response_status: outcome.response_status,
                response_time_ms: outcome.response_time_ms,
            }
        };

        info!(
            target: "webhook_delivery",
            org_id = %config.org_id,
            webhook_config_id = %config.id,
            success = result.success,
            response_status = ?result.response_status,
            "test webhook sent"
        );
        Ok(result)
    }

    /// Run one attempt for a PENDING entry and apply its outcome.
    ///
    /// Persists the new entry state with its attempt record and updates the
    /// configuration's health counters. Never fails: storage problems are
    /// logged and the in-memory result is returned.
    pub async fn attempt(
        &self,
        mut entry: DeliveryLogEntry,
        config: &WebhookConfig,
    ) -> DeliveryLogEntry {
        let started_at = self.clock.now();
        let outcome = match self.signed_request(
            config,
            &entry.event_type,
            entry.content_type,
            entry.payload.clone(),
            entry.attempt_number,
            started_at,
        ) {
            Ok(request) => self.send(request).await,
            Err(e) => AttemptOutcome::error(e.to_string(), None),
        };
        let completed_at = self.clock.now();
        let deliverable = self.still_deliverable(config).await;

        let attempt = match entry.complete_attempt(
            outcome,
            deliverable,
            &self.policy,
            started_at,
            completed_at,
        ) {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %entry.id,
                    status = %entry.status,
                    error = %e,
                    "attempt result rejected by delivery state"
                );
                return entry;
            }
        };

        if let Err(e) = self.store.record_attempt(&entry, &attempt).await {
            error!(
                target: "webhook_delivery",
                delivery_id = %entry.id,
                attempt_number = attempt.attempt_number,
                error = %e,
                "failed to persist delivery attempt"
            );
        }
        self.record_health(config, &entry, &attempt).await;
        log_attempt(&entry, &attempt);

        entry
    }

    /// Serialize the envelope, create the PENDING entry and stamp the
    /// configuration as triggered.
    async fn open_delivery(
        &self,
        config: &WebhookConfig,
        event: &OutboundEvent,
    ) -> ServiceResult<DeliveryLogEntry> {
        let now = self.clock.now();
        let body = Envelope::new(event.event_type.clone(), event.payload.clone(), now)
            .with_event_id(event.source_event_id.clone())
            .encode(config.content_type)?;

        let entry = DeliveryLogEntry::new(
            config,
            event.event_type.clone(),
            body,
            event.source_event_id.clone(),
            self.policy.max_attempts,
            now,
        );
        self.store.insert_delivery(&entry).await?;
        self.touch_triggered(config, now).await;

        debug!(
            target: "webhook_delivery",
            org_id = %config.org_id,
            webhook_config_id = %config.id,
            delivery_id = %entry.id,
            event_type = %entry.event_type,
            "delivery created"
        );
        Ok(entry)
    }

    async fn touch_triggered(&self, config: &WebhookConfig, now: DateTime<Utc>) {
        if let Err(e) = self.store.mark_triggered(config.org_id, config.id, now).await {
            warn!(
                target: "webhook_delivery",
                webhook_config_id = %config.id,
                error = %e,
                "failed to stamp last_triggered_at"
            );
        }
    }

    /// Assemble the signed POST for `body`, labelled with the `content_type`
    /// it was encoded with.
    ///
    /// Protocol headers go first; custom headers can never collide with them
    /// because reserved names are rejected when the configuration is saved.
    fn signed_request(
        &self,
        config: &WebhookConfig,
        event_type: &str,
        content_type: ContentType,
        body: String,
        attempt_number: u32,
        sent_at: DateTime<Utc>,
    ) -> Result<OutboundRequest, WebhookError> {
        let signature = signer::sign(&config.secret, body.as_bytes())?;

        let mut request =
            OutboundRequest::post(config.callback_url.clone(), body, config.timeout())
                .max_body_bytes(self.options.response_read_limit())
                .header("Content-Type", content_type.as_str())
                .header("User-Agent", self.options.user_agent.clone())
                .header(SIGNATURE_HEADER, signature)
                .header(EVENT_HEADER, event_type)
                .header(TIMESTAMP_HEADER, sent_at.timestamp().to_string());
        if attempt_number > 1 {
            request = request.header(RETRY_ATTEMPT_HEADER, attempt_number.to_string());
        }
        for (name, value) in config.custom_headers.iter() {
            request = request.header(name, value);
        }
        Ok(request)
    }

    async fn send(&self, request: OutboundRequest) -> AttemptOutcome {
        let started = Instant::now();
        let result = self.transport.send(request).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(response) => AttemptOutcome::response(
                response.status,
                truncate_body(&response.body, self.options.response_body_limit),
                response.headers,
                elapsed_ms,
            ),
            Err(e) => AttemptOutcome::error(e.to_string(), Some(elapsed_ms)),
        }
    }

    /// Whether the configuration may still receive retries, read fresh from
    /// the store.
    async fn still_deliverable(&self, config: &WebhookConfig) -> bool {
        match self.store.get_config(config.org_id, config.id).await {
            Ok(Some(current)) => current.can_deliver(),
            Ok(None) => false,
            Err(e) => {
                warn!(
                    target: "webhook_delivery",
                    webhook_config_id = %config.id,
                    error = %e,
                    "could not reload webhook configuration; using cached flags"
                );
                config.can_deliver()
            }
        }
    }

    async fn record_health(
        &self,
        config: &WebhookConfig,
        entry: &DeliveryLogEntry,
        attempt: &DeliveryAttempt,
    ) {
        let result = if entry.status == DeliveryStatus::Success {
            self.store
                .record_config_success(config.org_id, config.id, attempt.completed_at)
                .await
        } else {
            let reason = attempt
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            self.store
                .record_config_failure(config.org_id, config.id, &reason, attempt.completed_at)
                .await
        };

        if let Err(e) = result {
            warn!(
                target: "webhook_delivery",
                webhook_config_id = %config.id,
                error = %e,
                "failed to update webhook health counters"
            );
        }
    }
}

fn log_attempt(entry: &DeliveryLogEntry, attempt: &DeliveryAttempt) {
    match entry.status {
        DeliveryStatus::Success => info!(
            target: "webhook_delivery",
            org_id = %entry.org_id,
            webhook_config_id = %entry.webhook_config_id,
            delivery_id = %entry.id,
            event_type = %entry.event_type,
            attempt_number = attempt.attempt_number,
            response_status = ?attempt.response_status,
            response_time_ms = ?attempt.response_time_ms,
            "webhook delivered"
        ),
        DeliveryStatus::RetryScheduled => warn!(
            target: "webhook_delivery",
            org_id = %entry.org_id,
            webhook_config_id = %entry.webhook_config_id,
            delivery_id = %entry.id,
            event_type = %entry.event_type,
            attempt_number = attempt.attempt_number,
            response_status = ?attempt.response_status,
            error = ?attempt.error_message,
            next_retry_at = ?entry.next_retry_at,
            "webhook delivery failed, retry scheduled"
        ),
        _ => warn!(
            target: "webhook_delivery",
            org_id = %entry.org_id,
            webhook_config_id = %entry.webhook_config_id,
            delivery_id = %entry.id,
            event_type = %entry.event_type,
            attempt_number = attempt.attempt_number,
            response_status = ?attempt.response_status,
            error = ?attempt.error_message,
            status = %entry.status,
            "webhook delivery failed permanently"
        ),
    }
}
