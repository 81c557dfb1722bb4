//! In-memory webhook store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cmis_core::{DeliveryId, OrgId, WebhookConfigId};
use cmis_webhooks::{
    DeliveryAttempt, DeliveryCounts, DeliveryLogEntry, DeliveryStatus, WebhookConfig,
};

use super::{DeliveryQuery, WebhookStore};
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct InMemoryWebhookStore {
    configs: RwLock<HashMap<WebhookConfigId, WebhookConfig>>,
    deliveries: RwLock<HashMap<DeliveryId, DeliveryLogEntry>>,
    attempts: RwLock<HashMap<DeliveryId, Vec<DeliveryAttempt>>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every stored delivery, oldest first. Test helper.
    pub fn all_deliveries(&self) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        let deliveries = read(&self.deliveries)?;
        let mut all: Vec<_> = deliveries.values().cloned().collect();
        all.sort_by_key(|d| (d.created_at, d.id));
        Ok(all)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
}

/// Apply `f` to a stored configuration owned by `org_id`.
fn with_config<F>(
    configs: &RwLock<HashMap<WebhookConfigId, WebhookConfig>>,
    org_id: OrgId,
    id: WebhookConfigId,
    f: F,
) -> Result<(), StoreError>
where
    F: FnOnce(&mut WebhookConfig),
{
    let mut configs = write(configs)?;
    match configs.get_mut(&id) {
        Some(config) if config.org_id == org_id => {
            f(config);
            Ok(())
        }
        Some(_) => Err(StoreError::TenantIsolation),
        None => Err(StoreError::ConfigNotFound(id)),
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn insert_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        let mut configs = write(&self.configs)?;
        if configs.contains_key(&config.id) {
            return Err(StoreError::AlreadyExists(config.id.to_string()));
        }
        configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn get_config(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
    ) -> Result<Option<WebhookConfig>, StoreError> {
        let configs = read(&self.configs)?;
        Ok(configs.get(&id).filter(|c| c.org_id == org_id).cloned())
    }

    async fn update_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        with_config(&self.configs, config.org_id, config.id, |stored| {
            let health = std::mem::take(&mut stored.health);
            *stored = config.clone();
            stored.health = health;
        })
    }

    async fn delete_config(&self, org_id: OrgId, id: WebhookConfigId) -> Result<bool, StoreError> {
        let mut configs = write(&self.configs)?;
        match configs.get(&id) {
            Some(config) if config.org_id == org_id => {
                configs.remove(&id);
            }
            _ => return Ok(false),
        }
        drop(configs);

        // Deliveries and their attempts go with the configuration.
        let mut deliveries = write(&self.deliveries)?;
        let removed: Vec<DeliveryId> = deliveries
            .values()
            .filter(|d| d.webhook_config_id == id)
            .map(|d| d.id)
            .collect();
        for delivery_id in &removed {
            deliveries.remove(delivery_id);
        }
        drop(deliveries);

        let mut attempts = write(&self.attempts)?;
        for delivery_id in &removed {
            attempts.remove(delivery_id);
        }
        Ok(true)
    }

    async fn list_configs(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError> {
        let configs = read(&self.configs)?;
        let mut result: Vec<_> = configs
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(result)
    }

    async fn count_configs(&self, org_id: OrgId) -> Result<usize, StoreError> {
        let configs = read(&self.configs)?;
        Ok(configs.values().filter(|c| c.org_id == org_id).count())
    }

    async fn find_deliverable(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError> {
        let configs = read(&self.configs)?;
        let mut result: Vec<_> = configs
            .values()
            .filter(|c| c.org_id == org_id && c.can_deliver())
            .cloned()
            .collect();
        result.sort_by_key(|c| (c.created_at, c.id));
        Ok(result)
    }

    async fn mark_verified(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        callback_url: &str,
        verify_token: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut configs = write(&self.configs)?;
        match configs.get_mut(&id) {
            Some(config) if config.org_id == org_id => {
                if config.callback_url != callback_url || config.verify_token != verify_token {
                    return Ok(false);
                }
                config.mark_verified(at);
                Ok(true)
            }
            Some(_) => Err(StoreError::TenantIsolation),
            None => Err(StoreError::ConfigNotFound(id)),
        }
    }

    async fn mark_triggered(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        with_config(&self.configs, org_id, id, |c| c.record_triggered(at))
    }

    async fn record_config_success(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        with_config(&self.configs, org_id, id, |c| c.record_success(at))
    }

    async fn record_config_failure(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        with_config(&self.configs, org_id, id, |c| c.record_failure(error, at))
    }

    async fn insert_delivery(&self, entry: &DeliveryLogEntry) -> Result<(), StoreError> {
        let mut deliveries = write(&self.deliveries)?;
        if deliveries.contains_key(&entry.id) {
            return Err(StoreError::AlreadyExists(entry.id.to_string()));
        }
        deliveries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_delivery(
        &self,
        org_id: OrgId,
        id: DeliveryId,
    ) -> Result<Option<DeliveryLogEntry>, StoreError> {
        let deliveries = read(&self.deliveries)?;
        Ok(deliveries.get(&id).filter(|d| d.org_id == org_id).cloned())
    }

    async fn update_delivery(
        &self,
        entry: &DeliveryLogEntry,
        expected: DeliveryStatus,
    ) -> Result<(), StoreError> {
        let mut deliveries = write(&self.deliveries)?;
        let stored = match deliveries.get_mut(&entry.id) {
            Some(stored) if stored.org_id == entry.org_id => stored,
            Some(_) => return Err(StoreError::TenantIsolation),
            None => return Err(StoreError::DeliveryNotFound(entry.id)),
        };
        if stored.status != expected {
            return Err(StoreError::Conflict(format!(
                "delivery {} is {}, expected {}",
                entry.id, stored.status, expected
            )));
        }
        *stored = entry.clone();
        Ok(())
    }

    async fn record_attempt(
        &self,
        entry: &DeliveryLogEntry,
        attempt: &DeliveryAttempt,
    ) -> Result<(), StoreError> {
        let mut deliveries = write(&self.deliveries)?;
        let mut attempts = write(&self.attempts)?;

        let stored = match deliveries.get_mut(&entry.id) {
            Some(stored) if stored.org_id == entry.org_id => stored,
            Some(_) => return Err(StoreError::TenantIsolation),
            None => return Err(StoreError::DeliveryNotFound(entry.id)),
        };
        if stored.status != DeliveryStatus::Pending
            || stored.attempt_number != attempt.attempt_number
        {
            return Err(StoreError::Conflict(format!(
                "delivery {} is {} at attempt {}, cannot record attempt {}",
                entry.id, stored.status, stored.attempt_number, attempt.attempt_number
            )));
        }

        *stored = entry.clone();
        attempts.entry(entry.id).or_default().push(attempt.clone());
        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        let deliveries = read(&self.deliveries)?;
        let mut due: Vec<_> = deliveries.values().filter(|d| d.is_due(now)).cloned().collect();
        due.sort_by_key(|d| (d.next_retry_at, d.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_retry(
        &self,
        org_id: OrgId,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryLogEntry>, StoreError> {
        let mut deliveries = write(&self.deliveries)?;
        let Some(stored) = deliveries.get_mut(&id).filter(|d| d.org_id == org_id) else {
            return Ok(None);
        };

        let mut claimed = stored.clone();
        if claimed.claim_retry(now).is_err() {
            return Ok(None);
        }
        *stored = claimed.clone();
        Ok(Some(claimed))
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        let mut deliveries = write(&self.deliveries)?;
        let mut stale: Vec<&mut DeliveryLogEntry> = deliveries
            .values_mut()
            .filter(|d| d.status == DeliveryStatus::Pending && d.updated_at < stale_before)
            .collect();
        stale.sort_by_key(|d| (d.updated_at, d.id));
        stale.truncate(limit);

        let mut requeued = Vec::with_capacity(stale.len());
        for entry in stale {
            if entry.requeue_stale(now).is_ok() {
                requeued.push(entry.clone());
            }
        }
        Ok(requeued)
    }

    async fn list_deliveries(
        &self,
        org_id: OrgId,
        query: &DeliveryQuery,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        let deliveries = read(&self.deliveries)?;
        let mut result: Vec<_> = deliveries
            .values()
            .filter(|d| {
                d.org_id == org_id
                    && query.webhook_config_id.is_none_or(|id| d.webhook_config_id == id)
                    && query.status.is_none_or(|s| d.status == s)
            })
            .cloned()
            .collect();

        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(result
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .collect())
    }

    async fn list_attempts(
        &self,
        org_id: OrgId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let attempts = read(&self.attempts)?;
        Ok(attempts
            .get(&delivery_id)
            .map(|list| list.iter().filter(|a| a.org_id == org_id).cloned().collect())
            .unwrap_or_default())
    }

    async fn delivery_counts(
        &self,
        org_id: OrgId,
        webhook_config_id: WebhookConfigId,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, StoreError> {
        let deliveries = read(&self.deliveries)?;
        let mut counts = DeliveryCounts::default();
        for d in deliveries.values().filter(|d| {
            d.org_id == org_id && d.webhook_config_id == webhook_config_id && d.created_at >= since
        }) {
            counts.total += 1;
            match d.status {
                DeliveryStatus::Success => counts.success += 1,
                DeliveryStatus::Failed => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::TimeZone;

    use cmis_webhooks::{AttemptOutcome, NewWebhookConfig, RegistrationRules, RetryPolicy};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn config(org_id: OrgId) -> WebhookConfig {
        WebhookConfig::register(
            org_id,
            NewWebhookConfig {
                name: "CRM".to_string(),
                callback_url: "https://crm.example.com/hooks".to_string(),
                ..Default::default()
            },
            RegistrationRules::default(),
            t0(),
        )
        .unwrap()
    }

    async fn scheduled(store: &InMemoryWebhookStore, cfg: &WebhookConfig) -> DeliveryLogEntry {
        let mut entry =
            DeliveryLogEntry::new(cfg, "order.created", "{}".to_string(), None, 5, t0());
        store.insert_delivery(&entry).await.unwrap();
        let attempt = entry
            .complete_attempt(
                AttemptOutcome::response(503, String::new(), BTreeMap::new(), 5),
                true,
                &RetryPolicy::exponential(5, Duration::from_secs(60)),
                t0(),
                t0(),
            )
            .unwrap();
        store.record_attempt(&entry, &attempt).await.unwrap();
        entry
    }

    #[tokio::test]
    async fn configs_are_tenant_scoped() {
        let store = InMemoryWebhookStore::new();
        let org_a = OrgId::new();
        let org_b = OrgId::new();
        let cfg = config(org_a);
        store.insert_config(&cfg).await.unwrap();

        assert!(store.get_config(org_a, cfg.id).await.unwrap().is_some());
        assert!(store.get_config(org_b, cfg.id).await.unwrap().is_none());
        assert_eq!(store.count_configs(org_b).await.unwrap(), 0);
        assert!(!store.delete_config(org_b, cfg.id).await.unwrap());
        assert_eq!(
            store
                .mark_verified(org_b, cfg.id, &cfg.callback_url, &cfg.verify_token, t0())
                .await,
            Err(StoreError::TenantIsolation)
        );
    }

    #[tokio::test]
    async fn update_config_keeps_health_counters() {
        let store = InMemoryWebhookStore::new();
        let org = OrgId::new();
        let mut cfg = config(org);
        store.insert_config(&cfg).await.unwrap();
        store.record_config_failure(org, cfg.id, "HTTP 500", t0()).await.unwrap();

        cfg.name = "Renamed".to_string();
        store.update_config(&cfg).await.unwrap();

        let stored = store.get_config(org, cfg.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.health.failure_count, 1);
        assert_eq!(stored.health.consecutive_failure_count, 1);
    }

    #[tokio::test]
    async fn claim_retry_succeeds_once() {
        let store = InMemoryWebhookStore::new();
        let org = OrgId::new();
        let cfg = config(org);
        let entry = scheduled(&store, &cfg).await;
        let due_at = entry.next_retry_at.unwrap();

        assert!(store.claim_retry(org, entry.id, t0()).await.unwrap().is_none());

        let claimed = store.claim_retry(org, entry.id, due_at).await.unwrap().unwrap();
        assert_eq!(claimed.status, DeliveryStatus::Pending);
        assert_eq!(claimed.attempt_number, 2);

        assert!(store.claim_retry(org, entry.id, due_at).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_retries_are_oldest_first_and_limited() {
        let store = InMemoryWebhookStore::new();
        let org = OrgId::new();
        let cfg = config(org);
        let first = scheduled(&store, &cfg).await;
        let second = scheduled(&store, &cfg).await;
        let later = t0() + chrono::Duration::hours(1);

        let due = store.due_retries(later, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due[0].next_retry_at <= due[1].next_retry_at);

        let due = store.due_retries(later, 1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!([first.id, second.id].contains(&due[0].id));

        assert!(store.due_retries(t0(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = InMemoryWebhookStore::new();
        let org = OrgId::new();
        let cfg = config(org);
        let entry = scheduled(&store, &cfg).await;

        let err = store.update_delivery(&entry, DeliveryStatus::Pending).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list_attempts(org, entry.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn verification_only_sticks_to_the_handshaked_endpoint() {
        let store = InMemoryWebhookStore::new();
        let org = OrgId::new();
        let cfg = config(org);
        store.insert_config(&cfg).await.unwrap();

        let moved = store
            .mark_verified(org, cfg.id, "https://elsewhere.example.com", &cfg.verify_token, t0())
            .await
            .unwrap();
        assert!(!moved);
        let stale_token = store
            .mark_verified(org, cfg.id, &cfg.callback_url, "old-token", t0())
            .await
            .unwrap();
        assert!(!stale_token);
        assert!(!store.get_config(org, cfg.id).await.unwrap().unwrap().is_verified);

        let verified = store
            .mark_verified(org, cfg.id, &cfg.callback_url, &cfg.verify_token, t0())
            .await
            .unwrap();
        assert!(verified);
        assert!(store.get_config(org, cfg.id).await.unwrap().unwrap().is_verified);
    }

    #[tokio::test]
    async fn only_stale_pending_entries_are_requeued() {
        let store = InMemoryWebhookStore::new();
        let org = OrgId::new();
        let cfg = config(org);
        let stuck = DeliveryLogEntry::new(&cfg, "order.created", "{}".to_string(), None, 5, t0());
        store.insert_delivery(&stuck).await.unwrap();
        let retrying = scheduled(&store, &cfg).await;

        let later = t0() + chrono::Duration::minutes(10);
        let fresh =
            DeliveryLogEntry::new(&cfg, "order.created", "{}".to_string(), None, 5, later);
        store.insert_delivery(&fresh).await.unwrap();

        let stale_before = later - chrono::Duration::minutes(5);
        let requeued = store.requeue_stale(stale_before, later, 10).await.unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].id, stuck.id);

        let stored = store.get_delivery(org, stuck.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::RetryScheduled);
        assert_eq!(stored.next_retry_at, Some(later));

        let untouched = store.get_delivery(org, fresh.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, DeliveryStatus::Pending);
        let untouched = store.get_delivery(org, retrying.id).await.unwrap().unwrap();
        assert_eq!(untouched.next_retry_at, retrying.next_retry_at);

        assert!(store.requeue_stale(stale_before, later, 10).await.unwrap().is_empty());
    }
}
