//! Shared fixtures for the delivery integration tests.
//!
//! Everything runs against the in-memory store, a real reqwest transport
//! and wiremock endpoints, with a manual clock so retry schedules are exact.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use wiremock::{Request, Respond, ResponseTemplate};

use cmis_core::OrgId;
use cmis_infra::{
    Clock, Dispatcher, InMemoryWebhookStore, ManualClock, RegistryLimits, ReqwestTransport,
    RetryScheduler, WebhookRegistry, WebhookStore,
};
use cmis_webhooks::config::RegistrationRules;
use cmis_webhooks::{NewWebhookConfig, RetryPolicy, WebhookConfig};

pub type Store = Arc<InMemoryWebhookStore>;

pub const MAX_ATTEMPTS: u32 = 5;
pub const BASE_DELAY_SECS: u64 = 60;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
}

pub fn rules() -> RegistrationRules {
    RegistrationRules { allow_http: true }
}

pub struct Harness {
    pub store: Store,
    pub clock: ManualClock,
    pub transport: ReqwestTransport,
    pub dispatcher: Dispatcher<Store, ReqwestTransport>,
}

impl Harness {
    pub fn new() -> Self {
        let store = InMemoryWebhookStore::arc();
        let clock = ManualClock::new(t0());
        let transport = ReqwestTransport::with_default_user_agent().unwrap();
        let policy = RetryPolicy::exponential(
            MAX_ATTEMPTS,
            std::time::Duration::from_secs(BASE_DELAY_SECS),
        );
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), shared_clock, policy);

        Self {
            store,
            clock,
            transport,
            dispatcher,
        }
    }

    pub fn scheduler(&self) -> RetryScheduler<Store, ReqwestTransport> {
        RetryScheduler::new(self.dispatcher.clone())
    }

    pub fn registry(&self) -> WebhookRegistry<Store, ReqwestTransport> {
        WebhookRegistry::new(
            self.dispatcher.clone(),
            self.transport.clone(),
            RegistryLimits {
                rules: rules(),
                max_configs_per_org: 3,
            },
        )
    }

    /// Register a configuration directly in the store, unverified and inactive.
    pub async fn pending_config(&self, org_id: OrgId, url: &str, events: &[&str]) -> WebhookConfig {
        let config = WebhookConfig::register(
            org_id,
            NewWebhookConfig {
                name: "Test endpoint".to_string(),
                callback_url: url.to_string(),
                subscribed_events: events.iter().map(|e| e.to_string()).collect(),
                timeout_seconds: Some(5),
                ..Default::default()
            },
            rules(),
            t0(),
        )
        .unwrap();
        self.store.insert_config(&config).await.unwrap();
        config
    }

    /// Register a verified and active configuration.
    pub async fn active_config(&self, org_id: OrgId, url: &str, events: &[&str]) -> WebhookConfig {
        let mut config = self.pending_config(org_id, url, events).await;
        config.mark_verified(t0());
        config.set_active(true, t0()).unwrap();
        self.store.update_config(&config).await.unwrap();
        config
    }

    pub async fn deactivate(&self, config: &WebhookConfig) {
        let mut current = self
            .store
            .get_config(config.org_id, config.id)
            .await
            .unwrap()
            .unwrap();
        current.set_active(false, self.clock.now()).unwrap();
        self.store.update_config(&current).await.unwrap();
    }
}

/// Answers the verification handshake by echoing `hub_challenge`, with an
/// optional suffix appended.
pub struct EchoChallenge {
    pub suffix: &'static str,
}

impl Respond for EchoChallenge {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let challenge = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "hub_challenge")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_string(format!("{challenge}{}", self.suffix))
    }
}

pub fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}
