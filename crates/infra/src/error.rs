//! Infrastructure errors.

use std::time::Duration;

use thiserror::Error;

use cmis_core::{DeliveryId, DomainError, WebhookConfigId};
use cmis_webhooks::WebhookError;

/// Storage failures for webhook configurations and the delivery log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("webhook configuration not found: {0}")]
    ConfigNotFound(WebhookConfigId),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    #[error("tenant isolation violation")]
    TenantIsolation,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Failure to obtain an HTTP response at all.
///
/// Non-2xx responses are not transport errors; they are ordinary outcomes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request error: {0}")]
    Request(String),
}

/// Errors returned by the tenant-facing webhook services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("webhook configuration not found: {0}")]
    NotFound(WebhookConfigId),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    #[error("maximum of {0} webhook configurations per organization reached")]
    LimitReached(usize),

    #[error("webhook configuration {0} must be active and verified")]
    NotDeliverable(WebhookConfigId),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
