//! Outbound webhook domain.
//!
//! This crate contains the rules of the delivery subsystem as deterministic
//! domain logic (no IO, no HTTP, no storage): the registered endpoint
//! configuration, payload signing, the outbound envelope, the retry policy,
//! and the delivery log state machine.

pub mod catalog;
pub mod config;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod signer;
pub mod stats;

pub use config::{
    ContentType, CustomHeaders, DeliveryHealth, EventPattern, NewWebhookConfig, RegistrationRules,
    WebhookConfig, WebhookConfigUpdate,
};
pub use delivery::{AttemptOutcome, DeliveryAttempt, DeliveryLogEntry, DeliveryStatus};
pub use envelope::Envelope;
pub use error::WebhookError;
pub use policy::RetryPolicy;
pub use stats::{DeliveryCounts, WebhookStats};
