//! Known event types and upstream platforms.
//!
//! Subscriptions are not restricted to these values. They back the lists a
//! configuration UI offers, and names outside them are logged as likely typos.

/// Event types emitted by the application.
pub const EVENT_TYPES: &[(&str, &str)] = &[
    ("campaign.created", "Campaign created"),
    ("campaign.updated", "Campaign updated"),
    ("campaign.completed", "Campaign completed"),
    ("message.received", "Message received"),
    ("alert.triggered", "Alert triggered"),
    ("budget.threshold_reached", "Budget threshold reached"),
    ("performance.anomaly_detected", "Performance anomaly detected"),
    ("report.generated", "Report generated"),
];

/// Upstream platforms an endpoint may restrict itself to.
pub const PLATFORMS: &[(&str, &str)] = &[
    ("meta", "Meta"),
    ("google", "Google"),
    ("tiktok", "TikTok"),
    ("linkedin", "LinkedIn"),
    ("twitter", "X (Twitter)"),
    ("snapchat", "Snapchat"),
];

/// Synthetic event type used by test deliveries.
pub const TEST_EVENT_TYPE: &str = "webhook.test";

pub fn is_known_event_type(event_type: &str) -> bool {
    EVENT_TYPES.iter().any(|(key, _)| *key == event_type)
}

pub fn is_known_platform(platform: &str) -> bool {
    PLATFORMS.iter().any(|(key, _)| *key == platform)
}
