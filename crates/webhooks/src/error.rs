//! Webhook domain errors.

use thiserror::Error;

use cmis_core::DeliveryId;

use crate::delivery::DeliveryStatus;

/// Errors raised by webhook domain rules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("invalid callback url: {0}")]
    InvalidUrl(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("header `{0}` is reserved by the delivery protocol")]
    ReservedHeader(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("configuration must be verified before it can be activated")]
    NotVerified,

    #[error("delivery {0} is already {1}")]
    Terminal(DeliveryId, DeliveryStatus),

    #[error("invalid transition for delivery {id}: {reason}")]
    InvalidTransition { id: DeliveryId, reason: String },

    #[error("invalid signing key: {0}")]
    SigningKey(String),

    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

impl WebhookError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn transition(id: DeliveryId, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            id,
            reason: reason.into(),
        }
    }
}
