//! Persistence for webhook configurations and the delivery log.
//!
//! ## Write discipline
//!
//! - Configuration definitions (URL, filters, flags) are written by
//!   [`WebhookStore::update_config`]. Health counters are never written that
//!   way; they only move through the atomic `record_config_*` primitives, so a
//!   management edit cannot clobber counters bumped by a concurrent attempt.
//! - Delivery log entries only move forward through conditional writes keyed
//!   on the status the caller observed. A writer that lost a race gets
//!   [`StoreError::Conflict`] (or `None` from [`WebhookStore::claim_retry`]).
//! - Attempt records are append-only.
//! - An entry left PENDING past the stale threshold (its attempt result was
//!   never written) is recovered by [`WebhookStore::requeue_stale`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cmis_core::{DeliveryId, OrgId, WebhookConfigId};
use cmis_webhooks::{
    DeliveryAttempt, DeliveryCounts, DeliveryLogEntry, DeliveryStatus, WebhookConfig,
};

use crate::error::StoreError;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryWebhookStore;
pub use postgres::PostgresWebhookStore;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Filter and page for delivery log listings (newest first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryQuery {
    pub webhook_config_id: Option<WebhookConfigId>,
    pub status: Option<DeliveryStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for DeliveryQuery {
    fn default() -> Self {
        Self {
            webhook_config_id: None,
            status: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl DeliveryQuery {
    pub fn for_config(webhook_config_id: WebhookConfigId) -> Self {
        Self {
            webhook_config_id: Some(webhook_config_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    // --- configurations -------------------------------------------------

    async fn insert_config(&self, config: &WebhookConfig) -> Result<(), StoreError>;

    async fn get_config(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
    ) -> Result<Option<WebhookConfig>, StoreError>;

    /// Persist definition fields and flags. Health counters are left as stored.
    async fn update_config(&self, config: &WebhookConfig) -> Result<(), StoreError>;

    /// Returns whether a configuration was removed.
    async fn delete_config(&self, org_id: OrgId, id: WebhookConfigId) -> Result<bool, StoreError>;

    /// All configurations of an organization, newest first.
    async fn list_configs(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError>;

    async fn count_configs(&self, org_id: OrgId) -> Result<usize, StoreError>;

    /// Active and verified configurations of an organization.
    async fn find_deliverable(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError>;

    /// Mark a configuration verified, but only while its stored
    /// `callback_url` and `verify_token` are the ones the handshake used.
    ///
    /// Returns `false` when either changed in the meantime.
    async fn mark_verified(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        callback_url: &str,
        verify_token: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_triggered(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_config_success(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_config_failure(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- delivery log ---------------------------------------------------

    async fn insert_delivery(&self, entry: &DeliveryLogEntry) -> Result<(), StoreError>;

    async fn get_delivery(
        &self,
        org_id: OrgId,
        id: DeliveryId,
    ) -> Result<Option<DeliveryLogEntry>, StoreError>;

    /// Write `entry` if the stored status is still `expected`.
    async fn update_delivery(
        &self,
        entry: &DeliveryLogEntry,
        expected: DeliveryStatus,
    ) -> Result<(), StoreError>;

    /// Store the result of an attempt: the entry (which must still be
    /// PENDING in storage) and its attempt record, atomically.
    async fn record_attempt(
        &self,
        entry: &DeliveryLogEntry,
        attempt: &DeliveryAttempt,
    ) -> Result<(), StoreError>;

    /// RETRY_SCHEDULED entries with `next_retry_at <= now`, oldest due first,
    /// across all organizations.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError>;

    /// Atomically move a due RETRY_SCHEDULED entry back to PENDING and bump
    /// its attempt number. `None` if it is no longer claimable.
    async fn claim_retry(
        &self,
        org_id: OrgId,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryLogEntry>, StoreError>;

    /// Recover up to `limit` PENDING entries last touched before
    /// `stale_before`, across all organizations. See
    /// [`DeliveryLogEntry::requeue_stale`]. Returns the entries as written.
    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError>;

    async fn list_deliveries(
        &self,
        org_id: OrgId,
        query: &DeliveryQuery,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError>;

    /// Attempt history of one delivery, in attempt order.
    async fn list_attempts(
        &self,
        org_id: OrgId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Counts of entries created at or after `since`.
    async fn delivery_counts(
        &self,
        org_id: OrgId,
        webhook_config_id: WebhookConfigId,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, StoreError>;
}

#[async_trait]
impl<S: WebhookStore + ?Sized> WebhookStore for Arc<S> {
    async fn insert_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        (**self).insert_config(config).await
    }

    async fn get_config(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
    ) -> Result<Option<WebhookConfig>, StoreError> {
        (**self).get_config(org_id, id).await
    }

    async fn update_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        (**self).update_config(config).await
    }

    async fn delete_config(&self, org_id: OrgId, id: WebhookConfigId) -> Result<bool, StoreError> {
        (**self).delete_config(org_id, id).await
    }

    async fn list_configs(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError> {
        (**self).list_configs(org_id).await
    }

    async fn count_configs(&self, org_id: OrgId) -> Result<usize, StoreError> {
        (**self).count_configs(org_id).await
    }

    async fn find_deliverable(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError> {
        (**self).find_deliverable(org_id).await
    }

    async fn mark_verified(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        callback_url: &str,
        verify_token: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self)
            .mark_verified(org_id, id, callback_url, verify_token, at)
            .await
    }

    async fn mark_triggered(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_triggered(org_id, id, at).await
    }

    async fn record_config_success(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).record_config_success(org_id, id, at).await
    }

    async fn record_config_failure(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).record_config_failure(org_id, id, error, at).await
    }

    async fn insert_delivery(&self, entry: &DeliveryLogEntry) -> Result<(), StoreError> {
        (**self).insert_delivery(entry).await
    }

    async fn get_delivery(
        &self,
        org_id: OrgId,
        id: DeliveryId,
    ) -> Result<Option<DeliveryLogEntry>, StoreError> {
        (**self).get_delivery(org_id, id).await
    }

    async fn update_delivery(
        &self,
        entry: &DeliveryLogEntry,
        expected: DeliveryStatus,
    ) -> Result<(), StoreError> {
        (**self).update_delivery(entry, expected).await
    }

    async fn record_attempt(
        &self,
        entry: &DeliveryLogEntry,
        attempt: &DeliveryAttempt,
    ) -> Result<(), StoreError> {
        (**self).record_attempt(entry, attempt).await
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        (**self).due_retries(now, limit).await
    }

    async fn claim_retry(
        &self,
        org_id: OrgId,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryLogEntry>, StoreError> {
        (**self).claim_retry(org_id, id, now).await
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        (**self).requeue_stale(stale_before, now, limit).await
    }

    async fn list_deliveries(
        &self,
        org_id: OrgId,
        query: &DeliveryQuery,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        (**self).list_deliveries(org_id, query).await
    }

    async fn list_attempts(
        &self,
        org_id: OrgId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        (**self).list_attempts(org_id, delivery_id).await
    }

    async fn delivery_counts(
        &self,
        org_id: OrgId,
        webhook_config_id: WebhookConfigId,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, StoreError> {
        (**self).delivery_counts(org_id, webhook_config_id, since).await
    }
}
