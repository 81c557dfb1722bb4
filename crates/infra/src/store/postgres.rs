//! Postgres-backed webhook store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `Storage` |
//! | Database (check constraint violation) | `23514` | `Conflict` |
//! | Database (other) | any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Conditional writes that match no row are reported as `Conflict`
//! (delivery log) or `ConfigNotFound` (configurations).
//!
//! ## Tenant Isolation
//!
//! Every query includes `org_id` in the WHERE clause, except the retry scan
//! which is global by nature and returns rows carrying their own `org_id`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use cmis_core::{DeliveryId, OrgId, WebhookConfigId};
use cmis_webhooks::delivery::STALE_ATTEMPT_MESSAGE;
use cmis_webhooks::{
    ContentType, CustomHeaders, DeliveryAttempt, DeliveryCounts, DeliveryHealth, DeliveryLogEntry,
    DeliveryStatus, EventPattern, WebhookConfig,
};

use super::{DeliveryQuery, WebhookStore};
use crate::error::StoreError;

const SCHEMA: &str = include_str!("../../migrations/0001_webhooks.sql");

const CONFIG_COLUMNS: &str = r#"
    id, org_id, name, callback_url, secret, verify_token, subscribed_events,
    platform_filter, content_type, custom_headers, timeout_seconds, is_active,
    is_verified, verified_at, consecutive_failure_count, success_count,
    failure_count, last_triggered_at, last_success_at, last_failure_at,
    last_error, created_at, updated_at
"#;

const DELIVERY_COLUMNS: &str = r#"
    id, org_id, webhook_config_id, event_type, source_event_id, retry_of,
    payload, content_type, callback_url, status, attempt_number, max_attempts,
    next_retry_at, response_status, response_body, response_headers,
    response_time_ms, error_message, created_at, updated_at, completed_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresWebhookStore {
    pool: Arc<PgPool>,
}

impl PostgresWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_configs(
        &self,
        operation: &str,
        sql: &str,
        org_id: OrgId,
    ) -> Result<Vec<WebhookConfig>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(org_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter().map(config_from_row).collect()
    }

    /// Run a single-row UPDATE on a configuration; zero rows means it is gone.
    async fn touch_config(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        id: WebhookConfigId,
    ) -> Result<(), StoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConfigNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for PostgresWebhookStore {
    #[instrument(
        skip(self, config),
        fields(org_id = %config.org_id, webhook_config_id = %config.id),
        err
    )]
    async fn insert_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        let subscribed_events = to_json(&config.subscribed_events)?;
        let custom_headers = to_json(&config.custom_headers)?;
        let health = &config.health;

        sqlx::query(
            r#"
            INSERT INTO webhook_configs (
                id, org_id, name, callback_url, secret, verify_token, subscribed_events,
                platform_filter, content_type, custom_headers, timeout_seconds, is_active,
                is_verified, verified_at, consecutive_failure_count, success_count,
                failure_count, last_triggered_at, last_success_at, last_failure_at,
                last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23)
            "#,
        )
        .bind(config.id.as_uuid())
        .bind(config.org_id.as_uuid())
        .bind(&config.name)
        .bind(&config.callback_url)
        .bind(&config.secret)
        .bind(&config.verify_token)
        .bind(subscribed_events)
        .bind(&config.platform_filter)
        .bind(config.content_type.as_str())
        .bind(custom_headers)
        .bind(config.timeout_seconds as i32)
        .bind(config.is_active)
        .bind(config.is_verified)
        .bind(config.verified_at)
        .bind(health.consecutive_failure_count as i32)
        .bind(health.success_count as i64)
        .bind(health.failure_count as i64)
        .bind(health.last_triggered_at)
        .bind(health.last_success_at)
        .bind(health.last_failure_at)
        .bind(&health.last_error)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_config", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(org_id = %org_id, webhook_config_id = %id), err)]
    async fn get_config(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
    ) -> Result<Option<WebhookConfig>, StoreError> {
        let sql =
            format!("SELECT {CONFIG_COLUMNS} FROM webhook_configs WHERE org_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(org_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_config", e))?;

        row.as_ref().map(config_from_row).transpose()
    }

    #[instrument(
        skip(self, config),
        fields(org_id = %config.org_id, webhook_config_id = %config.id),
        err
    )]
    async fn update_config(&self, config: &WebhookConfig) -> Result<(), StoreError> {
        let subscribed_events = to_json(&config.subscribed_events)?;
        let custom_headers = to_json(&config.custom_headers)?;

        let query = sqlx::query(
            r#"
            UPDATE webhook_configs SET
                name = $3,
                callback_url = $4,
                secret = $5,
                verify_token = $6,
                subscribed_events = $7,
                platform_filter = $8,
                content_type = $9,
                custom_headers = $10,
                timeout_seconds = $11,
                is_active = $12,
                is_verified = $13,
                verified_at = $14,
                updated_at = $15
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(config.org_id.as_uuid())
        .bind(config.id.as_uuid())
        .bind(&config.name)
        .bind(&config.callback_url)
        .bind(&config.secret)
        .bind(&config.verify_token)
        .bind(subscribed_events)
        .bind(&config.platform_filter)
        .bind(config.content_type.as_str())
        .bind(custom_headers)
        .bind(config.timeout_seconds as i32)
        .bind(config.is_active)
        .bind(config.is_verified)
        .bind(config.verified_at)
        .bind(config.updated_at);

        self.touch_config("update_config", query, config.id).await
    }

    #[instrument(skip(self), fields(org_id = %org_id, webhook_config_id = %id), err)]
    async fn delete_config(&self, org_id: OrgId, id: WebhookConfigId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM webhook_configs WHERE org_id = $1 AND id = $2")
            .bind(org_id.as_uuid())
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_config", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    async fn list_configs(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM webhook_configs WHERE org_id = $1 \
             ORDER BY created_at DESC, id DESC"
        );
        self.fetch_configs("list_configs", &sql, org_id).await
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    async fn count_configs(&self, org_id: OrgId) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhook_configs WHERE org_id = $1")
                .bind(org_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_configs", e))?;
        Ok(count.max(0) as usize)
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    async fn find_deliverable(&self, org_id: OrgId) -> Result<Vec<WebhookConfig>, StoreError> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM webhook_configs \
             WHERE org_id = $1 AND is_active AND is_verified \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_configs("find_deliverable", &sql, org_id).await
    }

    #[instrument(skip(self), fields(org_id = %org_id, webhook_config_id = %id), err)]
    async fn mark_verified(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        callback_url: &str,
        verify_token: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_configs SET is_verified = TRUE, verified_at = $3, updated_at = $3 \
             WHERE org_id = $1 AND id = $2 AND callback_url = $4 AND verify_token = $5",
        )
        .bind(org_id.as_uuid())
        .bind(id.as_uuid())
        .bind(at)
        .bind(callback_url)
        .bind(verify_token)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_verified", e))?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM webhook_configs WHERE org_id = $1 AND id = $2)",
        )
        .bind(org_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_verified", e))?;
        if !exists {
            return Err(StoreError::ConfigNotFound(id));
        }
        Ok(false)
    }

    #[instrument(skip(self), fields(org_id = %org_id, webhook_config_id = %id), err)]
    async fn mark_triggered(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            "UPDATE webhook_configs SET last_triggered_at = $3 WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id.as_uuid())
        .bind(id.as_uuid())
        .bind(at);
        self.touch_config("mark_triggered", query, id).await
    }

    #[instrument(skip(self), fields(org_id = %org_id, webhook_config_id = %id), err)]
    async fn record_config_success(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE webhook_configs SET
                consecutive_failure_count = 0,
                success_count = success_count + 1,
                last_success_at = $3
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(id.as_uuid())
        .bind(at);
        self.touch_config("record_config_success", query, id).await
    }

    #[instrument(skip(self, error), fields(org_id = %org_id, webhook_config_id = %id), err)]
    async fn record_config_failure(
        &self,
        org_id: OrgId,
        id: WebhookConfigId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE webhook_configs SET
                consecutive_failure_count = consecutive_failure_count + 1,
                failure_count = failure_count + 1,
                last_failure_at = $3,
                last_error = $4
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(id.as_uuid())
        .bind(at)
        .bind(error);
        self.touch_config("record_config_failure", query, id).await
    }

    #[instrument(skip(self, entry), fields(org_id = %entry.org_id, delivery_id = %entry.id), err)]
    async fn insert_delivery(&self, entry: &DeliveryLogEntry) -> Result<(), StoreError> {
        let response_headers = to_json(&entry.response_headers)?;

        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, org_id, webhook_config_id, event_type, source_event_id, retry_of,
                payload, content_type, callback_url, status, attempt_number, max_attempts,
                next_retry_at, response_status, response_body, response_headers,
                response_time_ms, error_message, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.org_id.as_uuid())
        .bind(entry.webhook_config_id.as_uuid())
        .bind(&entry.event_type)
        .bind(&entry.source_event_id)
        .bind(entry.retry_of.map(|id| *id.as_uuid()))
        .bind(&entry.payload)
        .bind(entry.content_type.as_str())
        .bind(&entry.callback_url)
        .bind(entry.status.as_str())
        .bind(entry.attempt_number as i32)
        .bind(entry.max_attempts as i32)
        .bind(entry.next_retry_at)
        .bind(entry.response_status.map(i32::from))
        .bind(&entry.response_body)
        .bind(response_headers)
        .bind(entry.response_time_ms.map(|ms| ms as i64))
        .bind(&entry.error_message)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(entry.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_delivery", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(org_id = %org_id, delivery_id = %id), err)]
    async fn get_delivery(
        &self,
        org_id: OrgId,
        id: DeliveryId,
    ) -> Result<Option<DeliveryLogEntry>, StoreError> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE org_id = $1 AND id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(org_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_delivery", e))?;

        row.as_ref().map(delivery_from_row).transpose()
    }

    #[instrument(
        skip(self, entry),
        fields(org_id = %entry.org_id, delivery_id = %entry.id, status = %entry.status),
        err
    )]
    async fn update_delivery(
        &self,
        entry: &DeliveryLogEntry,
        expected: DeliveryStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("update_delivery", e))?;

        write_delivery(&mut tx, entry, expected, None).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("update_delivery", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, entry, attempt),
        fields(
            org_id = %entry.org_id,
            delivery_id = %entry.id,
            attempt_number = attempt.attempt_number
        ),
        err
    )]
    async fn record_attempt(
        &self,
        entry: &DeliveryLogEntry,
        attempt: &DeliveryAttempt,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_attempt", e))?;

        let expected_attempt = Some(attempt.attempt_number);
        write_delivery(&mut tx, entry, DeliveryStatus::Pending, expected_attempt).await?;

        sqlx::query(
            r#"
            INSERT INTO webhook_delivery_attempts (
                delivery_id, org_id, webhook_config_id, attempt_number, status,
                response_status, response_time_ms, error_message, next_retry_at,
                started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.delivery_id.as_uuid())
        .bind(attempt.org_id.as_uuid())
        .bind(attempt.webhook_config_id.as_uuid())
        .bind(attempt.attempt_number as i32)
        .bind(attempt.status.as_str())
        .bind(attempt.response_status.map(i32::from))
        .bind(attempt.response_time_ms.map(|ms| ms as i64))
        .bind(&attempt.error_message)
        .bind(attempt.next_retry_at)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "attempt {} of delivery {} already recorded",
                    attempt.attempt_number, attempt.delivery_id
                ))
            } else {
                map_sqlx_error("record_attempt", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_attempt", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
             WHERE status = 'retry_scheduled' AND next_retry_at <= $1 \
             ORDER BY next_retry_at ASC, id ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("due_retries", e))?;

        rows.iter().map(delivery_from_row).collect()
    }

    #[instrument(skip(self), fields(org_id = %org_id, delivery_id = %id), err)]
    async fn claim_retry(
        &self,
        org_id: OrgId,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryLogEntry>, StoreError> {
        let sql = format!(
            "UPDATE webhook_deliveries SET \
                 status = 'pending', \
                 attempt_number = attempt_number + 1, \
                 next_retry_at = NULL, \
                 updated_at = $3 \
             WHERE org_id = $1 AND id = $2 \
               AND status = 'retry_scheduled' \
               AND next_retry_at <= $3 \
               AND attempt_number < max_attempts \
             RETURNING {DELIVERY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(org_id.as_uuid())
            .bind(id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_retry", e))?;

        row.as_ref().map(delivery_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        let sql = format!(
            "UPDATE webhook_deliveries SET \
                 status = CASE WHEN attempt_number < max_attempts \
                     THEN 'retry_scheduled' ELSE 'failed' END, \
                 next_retry_at = CASE WHEN attempt_number < max_attempts THEN $2 END, \
                 completed_at = CASE WHEN attempt_number < max_attempts THEN NULL ELSE $2 END, \
                 error_message = $3, \
                 updated_at = $2 \
             WHERE status = 'pending' \
               AND id IN ( \
                 SELECT id FROM webhook_deliveries \
                 WHERE status = 'pending' AND updated_at < $1 \
                 ORDER BY updated_at ASC, id ASC \
                 LIMIT $4 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {DELIVERY_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(stale_before)
            .bind(now)
            .bind(STALE_ATTEMPT_MESSAGE)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        rows.iter().map(delivery_from_row).collect()
    }

    #[instrument(skip(self, query), fields(org_id = %org_id), err)]
    async fn list_deliveries(
        &self,
        org_id: OrgId,
        query: &DeliveryQuery,
    ) -> Result<Vec<DeliveryLogEntry>, StoreError> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
             WHERE org_id = $1 \
               AND ($2::uuid IS NULL OR webhook_config_id = $2) \
               AND ($3::text IS NULL OR status = $3) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $4 OFFSET $5"
        );
        let rows = sqlx::query(&sql)
            .bind(org_id.as_uuid())
            .bind(query.webhook_config_id.map(|id| *id.as_uuid()))
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.effective_limit() as i64)
            .bind(query.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_deliveries", e))?;

        rows.iter().map(delivery_from_row).collect()
    }

    #[instrument(skip(self), fields(org_id = %org_id, delivery_id = %delivery_id), err)]
    async fn list_attempts(
        &self,
        org_id: OrgId,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT delivery_id, org_id, webhook_config_id, attempt_number, status,
                   response_status, response_time_ms, error_message, next_retry_at,
                   started_at, completed_at
            FROM webhook_delivery_attempts
            WHERE org_id = $1 AND delivery_id = $2
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(delivery_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_attempts", e))?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            let row = AttemptRow::from_row(row)
                .map_err(|e| StoreError::Storage(format!("failed to decode attempt row: {e}")))?;
            attempts.push(row.try_into()?);
        }
        Ok(attempts)
    }

    #[instrument(skip(self), fields(org_id = %org_id, webhook_config_id = %webhook_config_id), err)]
    async fn delivery_counts(
        &self,
        org_id: OrgId,
        webhook_config_id: WebhookConfigId,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'success') AS success,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM webhook_deliveries
            WHERE org_id = $1 AND webhook_config_id = $2 AND created_at >= $3
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(webhook_config_id.as_uuid())
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delivery_counts", e))?;

        let get = |column: &str| -> Result<u64, StoreError> {
            row.try_get::<i64, _>(column)
                .map(|n| n.max(0) as u64)
                .map_err(|e| StoreError::Storage(format!("failed to decode {column}: {e}")))
        };

        Ok(DeliveryCounts {
            total: get("total")?,
            success: get("success")?,
            failed: get("failed")?,
        })
    }
}

/// Conditional UPDATE of the mutable delivery fields.
///
/// Matches only while the stored status is `expected` (and, for attempt
/// results, the stored attempt number is the one being recorded).
async fn write_delivery(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    entry: &DeliveryLogEntry,
    expected: DeliveryStatus,
    attempt_number: Option<u32>,
) -> Result<(), StoreError> {
    let response_headers = to_json(&entry.response_headers)?;

    let result = sqlx::query(
        r#"
        UPDATE webhook_deliveries SET
            status = $3,
            attempt_number = $4,
            next_retry_at = $5,
            response_status = $6,
            response_body = $7,
            response_headers = $8,
            response_time_ms = $9,
            error_message = $10,
            updated_at = $11,
            completed_at = $12
        WHERE org_id = $1 AND id = $2
          AND status = $13
          AND ($14::int IS NULL OR attempt_number = $14)
        "#,
    )
    .bind(entry.org_id.as_uuid())
    .bind(entry.id.as_uuid())
    .bind(entry.status.as_str())
    .bind(entry.attempt_number as i32)
    .bind(entry.next_retry_at)
    .bind(entry.response_status.map(i32::from))
    .bind(&entry.response_body)
    .bind(response_headers)
    .bind(entry.response_time_ms.map(|ms| ms as i64))
    .bind(&entry.error_message)
    .bind(entry.updated_at)
    .bind(entry.completed_at)
    .bind(expected.as_str())
    .bind(attempt_number.map(|n| n as i32))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_delivery", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "delivery {} is no longer {}",
            entry.id, expected
        )));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::Storage(format!("failed to encode json: {e}")))
}

fn config_from_row(row: &PgRow) -> Result<WebhookConfig, StoreError> {
    ConfigRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to decode webhook config row: {e}")))?
        .try_into()
}

fn delivery_from_row(row: &PgRow) -> Result<DeliveryLogEntry, StoreError> {
    DeliveryRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to decode delivery row: {e}")))?
        .try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_err(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("invalid {what} in row: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct ConfigRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    name: String,
    callback_url: String,
    secret: String,
    verify_token: String,
    subscribed_events: serde_json::Value,
    platform_filter: Option<String>,
    content_type: String,
    custom_headers: serde_json::Value,
    timeout_seconds: i32,
    is_active: bool,
    is_verified: bool,
    verified_at: Option<DateTime<Utc>>,
    consecutive_failure_count: i32,
    success_count: i64,
    failure_count: i64,
    last_triggered_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ConfigRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ConfigRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            name: row.try_get("name")?,
            callback_url: row.try_get("callback_url")?,
            secret: row.try_get("secret")?,
            verify_token: row.try_get("verify_token")?,
            subscribed_events: row.try_get("subscribed_events")?,
            platform_filter: row.try_get("platform_filter")?,
            content_type: row.try_get("content_type")?,
            custom_headers: row.try_get("custom_headers")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            is_active: row.try_get("is_active")?,
            is_verified: row.try_get("is_verified")?,
            verified_at: row.try_get("verified_at")?,
            consecutive_failure_count: row.try_get("consecutive_failure_count")?,
            success_count: row.try_get("success_count")?,
            failure_count: row.try_get("failure_count")?,
            last_triggered_at: row.try_get("last_triggered_at")?,
            last_success_at: row.try_get("last_success_at")?,
            last_failure_at: row.try_get("last_failure_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ConfigRow> for WebhookConfig {
    type Error = StoreError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        let subscribed_events: Vec<EventPattern> = serde_json::from_value(row.subscribed_events)
            .map_err(|e| decode_err("subscribed_events", e))?;
        let custom_headers: CustomHeaders = serde_json::from_value(row.custom_headers)
            .map_err(|e| decode_err("custom_headers", e))?;
        let content_type: ContentType = row
            .content_type
            .parse()
            .map_err(|e| decode_err("content_type", e))?;

        Ok(WebhookConfig {
            id: WebhookConfigId::from_uuid(row.id),
            org_id: OrgId::from_uuid(row.org_id),
            name: row.name,
            callback_url: row.callback_url,
            secret: row.secret,
            verify_token: row.verify_token,
            subscribed_events,
            platform_filter: row.platform_filter,
            content_type,
            custom_headers,
            timeout_seconds: row.timeout_seconds.max(0) as u32,
            is_active: row.is_active,
            is_verified: row.is_verified,
            verified_at: row.verified_at,
            health: DeliveryHealth {
                consecutive_failure_count: row.consecutive_failure_count.max(0) as u32,
                success_count: row.success_count.max(0) as u64,
                failure_count: row.failure_count.max(0) as u64,
                last_triggered_at: row.last_triggered_at,
                last_success_at: row.last_success_at,
                last_failure_at: row.last_failure_at,
                last_error: row.last_error,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct DeliveryRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    webhook_config_id: uuid::Uuid,
    event_type: String,
    source_event_id: Option<String>,
    retry_of: Option<uuid::Uuid>,
    payload: String,
    content_type: String,
    callback_url: String,
    status: String,
    attempt_number: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    response_status: Option<i32>,
    response_body: Option<String>,
    response_headers: serde_json::Value,
    response_time_ms: Option<i64>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeliveryRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            webhook_config_id: row.try_get("webhook_config_id")?,
            event_type: row.try_get("event_type")?,
            source_event_id: row.try_get("source_event_id")?,
            retry_of: row.try_get("retry_of")?,
            payload: row.try_get("payload")?,
            content_type: row.try_get("content_type")?,
            callback_url: row.try_get("callback_url")?,
            status: row.try_get("status")?,
            attempt_number: row.try_get("attempt_number")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            response_status: row.try_get("response_status")?,
            response_body: row.try_get("response_body")?,
            response_headers: row.try_get("response_headers")?,
            response_time_ms: row.try_get("response_time_ms")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<DeliveryRow> for DeliveryLogEntry {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status: DeliveryStatus = row.status.parse().map_err(|e| decode_err("status", e))?;
        let content_type: ContentType = row
            .content_type
            .parse()
            .map_err(|e| decode_err("content_type", e))?;
        let response_headers: BTreeMap<String, String> =
            serde_json::from_value(row.response_headers)
                .map_err(|e| decode_err("response_headers", e))?;
        let response_status = row
            .response_status
            .map(u16::try_from)
            .transpose()
            .map_err(|e| decode_err("response_status", e))?;

        Ok(DeliveryLogEntry {
            id: DeliveryId::from_uuid(row.id),
            webhook_config_id: WebhookConfigId::from_uuid(row.webhook_config_id),
            org_id: OrgId::from_uuid(row.org_id),
            event_type: row.event_type,
            source_event_id: row.source_event_id,
            retry_of: row.retry_of.map(DeliveryId::from_uuid),
            payload: row.payload,
            content_type,
            callback_url: row.callback_url,
            status,
            attempt_number: row.attempt_number.max(1) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            next_retry_at: row.next_retry_at,
            response_status,
            response_body: row.response_body,
            response_headers,
            response_time_ms: row.response_time_ms.map(|ms| ms.max(0) as u64),
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug)]
struct AttemptRow {
    delivery_id: uuid::Uuid,
    org_id: uuid::Uuid,
    webhook_config_id: uuid::Uuid,
    attempt_number: i32,
    status: String,
    response_status: Option<i32>,
    response_time_ms: Option<i64>,
    error_message: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AttemptRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AttemptRow {
            delivery_id: row.try_get("delivery_id")?,
            org_id: row.try_get("org_id")?,
            webhook_config_id: row.try_get("webhook_config_id")?,
            attempt_number: row.try_get("attempt_number")?,
            status: row.try_get("status")?,
            response_status: row.try_get("response_status")?,
            response_time_ms: row.try_get("response_time_ms")?,
            error_message: row.try_get("error_message")?,
            next_retry_at: row.try_get("next_retry_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<AttemptRow> for DeliveryAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(DeliveryAttempt {
            delivery_id: DeliveryId::from_uuid(row.delivery_id),
            org_id: OrgId::from_uuid(row.org_id),
            webhook_config_id: WebhookConfigId::from_uuid(row.webhook_config_id),
            attempt_number: row.attempt_number.max(1) as u32,
            status: row.status.parse().map_err(|e| decode_err("status", e))?,
            response_status: row
                .response_status
                .map(u16::try_from)
                .transpose()
                .map_err(|e| decode_err("response_status", e))?,
            response_time_ms: row.response_time_ms.map(|ms| ms.max(0) as u64),
            error_message: row.error_message,
            next_retry_at: row.next_retry_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
