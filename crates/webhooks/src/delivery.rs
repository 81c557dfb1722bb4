//! Delivery log: one logical delivery (one event to one configuration)
//! across all of its attempts.
//!
//! ## State machine
//!
//! ```text
//!            success
//! PENDING ───────────────────────────────► SUCCESS
//!    │  ▲
//!    │  │ claim_retry (attempt += 1)
//!    │  │
//!    │  RETRY_SCHEDULED ◄── failure, attempts remain, config deliverable
//!    │
//!    └── failure, attempts exhausted or config not deliverable ─► FAILED
//! ```
//!
//! SUCCESS and FAILED are terminal: every mutator rejects them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cmis_core::{DeliveryId, DomainError, OrgId, WebhookConfigId};

use crate::config::{ContentType, WebhookConfig};
use crate::error::WebhookError;
use crate::policy::RetryPolicy;

/// Error recorded on entries recovered by [`DeliveryLogEntry::requeue_stale`].
pub const STALE_ATTEMPT_MESSAGE: &str = "attempt outcome was never recorded";

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Awaiting, or in the middle of, an attempt.
    Pending,
    Success,
    Failed,
    /// Transient failure; another attempt is due at `next_retry_at`.
    RetryScheduled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::RetryScheduled => "retry_scheduled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            "retry_scheduled" => Ok(DeliveryStatus::RetryScheduled),
            other => Err(DomainError::validation(format!("unknown delivery status: {other}"))),
        }
    }
}

/// What came back from one HTTP attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: BTreeMap<String, String>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl AttemptOutcome {
    /// The endpoint answered. Non-2xx answers carry an `HTTP <code>` error.
    pub fn response(
        status: u16,
        body: String,
        headers: BTreeMap<String, String>,
        response_time_ms: u64,
    ) -> Self {
        let error_message = (!(200..300).contains(&status)).then(|| format!("HTTP {status}"));
        Self {
            response_status: Some(status),
            response_body: Some(strip_nul(&body)),
            response_headers: headers,
            response_time_ms: Some(response_time_ms),
            error_message,
        }
    }

    /// No usable response (connect failure, timeout, build error, ...).
    pub fn error(message: impl Into<String>, response_time_ms: Option<u64>) -> Self {
        Self {
            error_message: Some(strip_nul(&message.into())),
            response_time_ms,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.response_status, Some(code) if (200..300).contains(&code))
    }

    /// Short human-readable reason used for logs and health telemetry.
    pub fn failure_reason(&self) -> String {
        self.error_message
            .clone()
            .or_else(|| self.response_status.map(|c| format!("HTTP {c}")))
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Immutable record of one attempt, appended after every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub delivery_id: DeliveryId,
    pub org_id: OrgId,
    pub webhook_config_id: WebhookConfigId,
    pub attempt_number: u32,
    /// Status of the delivery right after this attempt.
    pub status: DeliveryStatus,
    pub response_status: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Current state of one delivery.
///
/// The response fields describe the most recent attempt only; earlier
/// attempts are kept as [`DeliveryAttempt`] records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: DeliveryId,
    pub webhook_config_id: WebhookConfigId,
    pub org_id: OrgId,
    pub event_type: String,
    pub source_event_id: Option<String>,
    /// Set when a tenant manually re-sent a failed delivery.
    pub retry_of: Option<DeliveryId>,
    /// Exact request body, byte-for-byte what was signed and sent.
    pub payload: String,
    /// Media type `payload` was encoded with. Every attempt is labelled
    /// with it, whatever the configuration says by then.
    pub content_type: ContentType,
    /// Snapshot of the callback URL at creation time.
    pub callback_url: String,
    pub status: DeliveryStatus,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: BTreeMap<String, String>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryLogEntry {
    /// Create the entry for a first attempt: PENDING, attempt 1.
    pub fn new(
        config: &WebhookConfig,
        event_type: impl Into<String>,
        payload: String,
        source_event_id: Option<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            webhook_config_id: config.id,
            org_id: config.org_id,
            event_type: event_type.into(),
            source_event_id,
            retry_of: None,
            payload,
            content_type: config.content_type,
            callback_url: config.callback_url.clone(),
            status: DeliveryStatus::Pending,
            attempt_number: 1,
            max_attempts: max_attempts.max(1),
            next_retry_at: None,
            response_status: None,
            response_body: None,
            response_headers: BTreeMap::new(),
            response_time_ms: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Start a new delivery that re-sends the payload of a FAILED one.
    ///
    /// The failed entry itself is left untouched.
    pub fn resend_of(
        failed: &DeliveryLogEntry,
        config: &WebhookConfig,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, WebhookError> {
        if failed.status != DeliveryStatus::Failed {
            return Err(WebhookError::transition(
                failed.id,
                format!("only failed deliveries can be re-sent (status is {})", failed.status),
            ));
        }
        if failed.webhook_config_id != config.id {
            return Err(WebhookError::transition(
                failed.id,
                "delivery belongs to a different configuration",
            ));
        }

        let mut entry = Self::new(
            config,
            failed.event_type.clone(),
            failed.payload.clone(),
            failed.source_event_id.clone(),
            max_attempts,
            now,
        );
        entry.retry_of = Some(failed.id);
        entry.content_type = failed.content_type;
        Ok(entry)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::RetryScheduled
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    pub fn is_retry(&self) -> bool {
        self.attempt_number > 1
    }

    fn ensure_not_terminal(&self) -> Result<(), WebhookError> {
        if self.status.is_terminal() {
            return Err(WebhookError::Terminal(self.id, self.status));
        }
        Ok(())
    }

    /// Apply the outcome of the current attempt.
    ///
    /// - 2xx: SUCCESS.
    /// - otherwise, attempts remaining and `config_deliverable`:
    ///   RETRY_SCHEDULED, due `policy` delay after `now`.
    /// - otherwise: FAILED.
    ///
    /// Returns the attempt record to append to the history.
    pub fn complete_attempt(
        &mut self,
        outcome: AttemptOutcome,
        config_deliverable: bool,
        policy: &RetryPolicy,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt, WebhookError> {
        self.ensure_not_terminal()?;
        if self.status != DeliveryStatus::Pending {
            return Err(WebhookError::transition(
                self.id,
                format!("no attempt in progress (status is {})", self.status),
            ));
        }

        let success = outcome.is_success();
        self.response_status = outcome.response_status;
        self.response_body = outcome.response_body;
        self.response_headers = outcome.response_headers;
        self.response_time_ms = outcome.response_time_ms;
        self.error_message = outcome.error_message;
        self.updated_at = now;

        if success {
            self.status = DeliveryStatus::Success;
            self.next_retry_at = None;
            self.completed_at = Some(now);
        } else if self.attempt_number < self.max_attempts && config_deliverable {
            self.status = DeliveryStatus::RetryScheduled;
            self.next_retry_at = Some(policy.next_retry_at(self.attempt_number, now));
        } else {
            self.status = DeliveryStatus::Failed;
            self.next_retry_at = None;
            self.completed_at = Some(now);
        }

        Ok(DeliveryAttempt {
            delivery_id: self.id,
            org_id: self.org_id,
            webhook_config_id: self.webhook_config_id,
            attempt_number: self.attempt_number,
            status: self.status,
            response_status: self.response_status,
            response_time_ms: self.response_time_ms,
            error_message: self.error_message.clone(),
            next_retry_at: self.next_retry_at,
            started_at,
            completed_at: now,
        })
    }

    /// Take a due RETRY_SCHEDULED entry for the next attempt.
    pub fn claim_retry(&mut self, now: DateTime<Utc>) -> Result<(), WebhookError> {
        self.ensure_not_terminal()?;
        if self.status != DeliveryStatus::RetryScheduled {
            return Err(WebhookError::transition(
                self.id,
                format!("not scheduled for retry (status is {})", self.status),
            ));
        }
        if !self.is_due(now) {
            return Err(WebhookError::transition(self.id, "retry is not due yet"));
        }
        if self.attempt_number >= self.max_attempts {
            return Err(WebhookError::transition(self.id, "attempts exhausted"));
        }

        self.attempt_number += 1;
        self.next_retry_at = None;
        self.status = DeliveryStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    /// Recover an entry left PENDING by an attempt whose result was never
    /// recorded (crashed worker, failed write).
    ///
    /// With attempts left it becomes RETRY_SCHEDULED and due at `now`;
    /// otherwise it is FAILED. The lost attempt counts as used.
    pub fn requeue_stale(&mut self, now: DateTime<Utc>) -> Result<(), WebhookError> {
        self.ensure_not_terminal()?;
        if self.status != DeliveryStatus::Pending {
            return Err(WebhookError::transition(
                self.id,
                format!("only pending deliveries can be requeued (status is {})", self.status),
            ));
        }

        self.error_message = Some(STALE_ATTEMPT_MESSAGE.to_string());
        self.updated_at = now;
        if self.attempt_number < self.max_attempts {
            self.status = DeliveryStatus::RetryScheduled;
            self.next_retry_at = Some(now);
        } else {
            self.status = DeliveryStatus::Failed;
            self.next_retry_at = None;
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Give up without another network call (e.g. the configuration was
    /// deactivated since the retry was scheduled).
    pub fn abandon(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        self.ensure_not_terminal()?;
        self.status = DeliveryStatus::Failed;
        self.next_retry_at = None;
        self.error_message = Some(reason.into());
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }
}

/// Truncate a response body to at most `limit` characters, dropping NUL
/// characters (text columns cannot store them).
pub fn truncate_body(body: &str, limit: usize) -> String {
    body.chars().filter(|c| *c != '\0').take(limit).collect()
}

fn strip_nul(text: &str) -> String {
    text.replace('\0', "")
}
