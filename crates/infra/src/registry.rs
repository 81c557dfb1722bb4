//! Tenant-facing webhook management.
//!
//! Every operation is scoped by `org_id`; a configuration or delivery of
//! another organization is reported as not found.

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use cmis_core::{DeliveryId, OrgId, WebhookConfigId};
use cmis_webhooks::{
    DeliveryAttempt, DeliveryLogEntry, NewWebhookConfig, RegistrationRules, WebhookConfig,
    WebhookConfigUpdate, WebhookStats,
};

use crate::clock::Clock;
use crate::dispatcher::{Dispatcher, TestResult};
use crate::error::{ServiceError, ServiceResult};
use crate::settings::{DEFAULT_MAX_CONFIGS_PER_ORG, DeliverySettings};
use crate::store::{DeliveryQuery, WebhookStore};
use crate::transport::HttpTransport;
use crate::verifier::{VerificationResult, Verifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub rules: RegistrationRules,
    pub max_configs_per_org: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            rules: RegistrationRules::default(),
            max_configs_per_org: DEFAULT_MAX_CONFIGS_PER_ORG,
        }
    }
}

impl From<&DeliverySettings> for RegistryLimits {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            rules: settings.registration_rules(),
            max_configs_per_org: settings.max_configs_per_org,
        }
    }
}

pub struct WebhookRegistry<S, T> {
    store: S,
    verifier: Verifier<S, T>,
    dispatcher: Dispatcher<S, T>,
    clock: Arc<dyn Clock>,
    limits: RegistryLimits,
}

impl<S, T> WebhookRegistry<S, T>
where
    S: WebhookStore + Clone,
    T: HttpTransport + Clone,
{
    /// Build the registry around a dispatcher, sharing its store, transport
    /// and clock.
    pub fn new(dispatcher: Dispatcher<S, T>, transport: T, limits: RegistryLimits) -> Self {
        let store = dispatcher.store().clone();
        let clock = dispatcher.clock().clone();
        Self {
            verifier: Verifier::new(store.clone(), transport, clock.clone()),
            store,
            dispatcher,
            clock,
            limits,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<S, T> {
        &self.dispatcher
    }

    pub async fn register(
        &self,
        org_id: OrgId,
        input: NewWebhookConfig,
    ) -> ServiceResult<WebhookConfig> {
        if self.store.count_configs(org_id).await? >= self.limits.max_configs_per_org {
            return Err(ServiceError::LimitReached(self.limits.max_configs_per_org));
        }

        let config = WebhookConfig::register(org_id, input, self.limits.rules, self.clock.now())?;
        self.store.insert_config(&config).await?;

        info!(
            org_id = %org_id,
            webhook_config_id = %config.id,
            callback_url = %config.callback_url,
            "webhook configuration registered"
        );
        warn_uncatalogued(&config);
        Ok(config)
    }

    pub async fn get(&self, org_id: OrgId, id: WebhookConfigId) -> ServiceResult<WebhookConfig> {
        self.store
            .get_config(org_id, id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Newest first.
    pub async fn list(&self, org_id: OrgId) -> ServiceResult<Vec<WebhookConfig>> {
        Ok(self.store.list_configs(org_id).await?)
    }

    pub async fn update(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        update: WebhookConfigUpdate,
    ) -> ServiceResult<WebhookConfig> {
        let mut config = self.get(org_id, id).await?;
        let previous_url = config.callback_url.clone();
        config.apply_update(update, self.limits.rules, self.clock.now())?;
        self.store.update_config(&config).await?;

        if config.callback_url != previous_url {
            info!(
                org_id = %org_id,
                webhook_config_id = %id,
                "callback url changed; endpoint must be verified again"
            );
        }
        warn_uncatalogued(&config);
        Ok(config)
    }

    /// Flip `is_active`. Returns the new value.
    pub async fn toggle_active(&self, org_id: OrgId, id: WebhookConfigId) -> ServiceResult<bool> {
        let mut config = self.get(org_id, id).await?;
        let active = config.toggle_active(self.clock.now())?;
        self.store.update_config(&config).await?;

        info!(org_id = %org_id, webhook_config_id = %id, active, "webhook active flag toggled");
        Ok(active)
    }

    /// Issue a new verify token. The configuration becomes unverified.
    pub async fn regenerate_verify_token(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
    ) -> ServiceResult<String> {
        let mut config = self.get(org_id, id).await?;
        let token = config.regenerate_verify_token(self.clock.now()).to_string();
        self.store.update_config(&config).await?;

        info!(org_id = %org_id, webhook_config_id = %id, "webhook verify token regenerated");
        Ok(token)
    }

    pub async fn regenerate_secret(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
    ) -> ServiceResult<String> {
        let mut config = self.get(org_id, id).await?;
        let secret = config.regenerate_secret(self.clock.now()).to_string();
        self.store.update_config(&config).await?;

        info!(org_id = %org_id, webhook_config_id = %id, "webhook secret regenerated");
        Ok(secret)
    }

    pub async fn delete(&self, org_id: OrgId, id: WebhookConfigId) -> ServiceResult<()> {
        if !self.store.delete_config(org_id, id).await? {
            return Err(ServiceError::NotFound(id));
        }
        info!(org_id = %org_id, webhook_config_id = %id, "webhook configuration deleted");
        Ok(())
    }

    /// Run the ownership handshake for a configuration.
    pub async fn verify(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
    ) -> ServiceResult<VerificationResult> {
        let config = self.get(org_id, id).await?;
        Ok(self.verifier.verify(&config).await?)
    }

    pub async fn test(&self, org_id: OrgId, id: WebhookConfigId) -> ServiceResult<TestResult> {
        let config = self.get(org_id, id).await?;
        self.dispatcher.test_webhook(&config).await
    }

    /// Delivery log of one configuration, newest first.
    pub async fn deliveries(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        query: DeliveryQuery,
    ) -> ServiceResult<Vec<DeliveryLogEntry>> {
        self.get(org_id, id).await?;
        let query = DeliveryQuery {
            webhook_config_id: Some(id),
            ..query
        };
        Ok(self.store.list_deliveries(org_id, &query).await?)
    }

    pub async fn delivery(
        &self,
        org_id: OrgId,
        delivery_id: DeliveryId,
    ) -> ServiceResult<DeliveryLogEntry> {
        self.store
            .get_delivery(org_id, delivery_id)
            .await?
            .ok_or(ServiceError::DeliveryNotFound(delivery_id))
    }

    /// Per-attempt history of a delivery.
    pub async fn attempts(
        &self,
        org_id: OrgId,
        delivery_id: DeliveryId,
    ) -> ServiceResult<Vec<DeliveryAttempt>> {
        self.delivery(org_id, delivery_id).await?;
        Ok(self.store.list_attempts(org_id, delivery_id).await?)
    }

    /// Re-send a FAILED delivery as a new delivery linked through `retry_of`.
    pub async fn retry_delivery(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        delivery_id: DeliveryId,
    ) -> ServiceResult<DeliveryLogEntry> {
        let config = self.get(org_id, id).await?;
        let failed = self.delivery(org_id, delivery_id).await?;
        if failed.webhook_config_id != config.id {
            return Err(ServiceError::DeliveryNotFound(delivery_id));
        }
        self.dispatcher.resend(&failed, &config).await
    }

    pub async fn stats(&self, org_id: OrgId, id: WebhookConfigId) -> ServiceResult<WebhookStats> {
        let config = self.get(org_id, id).await?;
        let now = self.clock.now();
        let last_24h = self
            .store
            .delivery_counts(org_id, id, now - Duration::hours(24))
            .await?;
        let last_7d = self
            .store
            .delivery_counts(org_id, id, now - Duration::days(7))
            .await?;
        Ok(WebhookStats::new(&config.health, last_24h, last_7d))
    }
}

fn warn_uncatalogued(config: &WebhookConfig) {
    let unknown = config.uncatalogued();
    if !unknown.is_empty() {
        warn!(
            org_id = %config.org_id,
            webhook_config_id = %config.id,
            unknown = ?unknown,
            "subscription names event types or platforms outside the catalog"
        );
    }
}
