//! `cmis-core`: identifiers and error primitives shared by the webhook crates.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{DeliveryId, OrgId, WebhookConfigId};
