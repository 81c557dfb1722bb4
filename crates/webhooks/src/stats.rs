//! Per-configuration delivery statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeliveryHealth;

/// Delivery log counts over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookStats {
    /// Attempts recorded by the health counters.
    pub total_deliveries: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: Option<f64>,
    pub last_24h: DeliveryCounts,
    pub last_7d: DeliveryCounts,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WebhookStats {
    pub fn new(health: &DeliveryHealth, last_24h: DeliveryCounts, last_7d: DeliveryCounts) -> Self {
        Self {
            total_deliveries: health.success_count + health.failure_count,
            success_count: health.success_count,
            failure_count: health.failure_count,
            success_rate: health.success_rate(),
            last_24h,
            last_7d,
            last_triggered_at: health.last_triggered_at,
            last_success_at: health.last_success_at,
            last_failure_at: health.last_failure_at,
            last_error: health.last_error.clone(),
        }
    }
}
