//! Infrastructure layer: storage, HTTP transport and the webhook delivery
//! services built on them.

pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod transport;
pub mod verifier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchOptions, Dispatcher, OutboundEvent, TestResult};
pub use error::{ServiceError, ServiceResult, StoreError, TransportError};
pub use registry::{RegistryLimits, WebhookRegistry};
pub use scheduler::{
    RetryPass, RetryScheduler, RetryWorkerConfig, RetryWorkerHandle, RetryWorkerStats,
};
pub use settings::{DeliverySettings, SettingsError};
pub use store::{DeliveryQuery, InMemoryWebhookStore, PostgresWebhookStore, WebhookStore};
pub use transport::{HttpTransport, OutboundRequest, ReqwestTransport};
pub use verifier::{VerificationResult, Verifier};
