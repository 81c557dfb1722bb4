//! Subscription registry entry: a tenant's registered webhook endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cmis_core::{DomainError, OrgId, WebhookConfigId};

use crate::catalog;
use crate::error::WebhookError;
use crate::protocol;
use crate::signer::random_hex;

pub const DEFAULT_TIMEOUT_SECS: u32 = 30;
pub const MIN_TIMEOUT_SECS: u32 = 5;
pub const MAX_TIMEOUT_SECS: u32 = 60;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_URL_LEN: usize = 500;

/// Random bytes behind generated secrets and verify tokens.
const TOKEN_BYTES: usize = 32;

/// Policy knobs applied when a configuration is created or edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistrationRules {
    /// Accept plain `http://` callback URLs (dev/test only).
    pub allow_http: bool,
}

/// Subscription pattern for event types.
///
/// `*` matches everything, `campaign.*` matches every event whose type starts
/// with `campaign.`, anything else is an exact match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventPattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl EventPattern {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventPattern::Any => true,
            EventPattern::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            EventPattern::Exact(exact) => exact == event_type,
        }
    }
}

impl FromStr for EventPattern {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(WebhookError::validation("event pattern must not be empty"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(WebhookError::validation(format!(
                "event pattern `{s}` must not contain whitespace"
            )));
        }
        if s == "*" {
            return Ok(EventPattern::Any);
        }
        if let Some(stem) = s.strip_suffix(".*") {
            if stem.is_empty() || stem.contains('*') {
                return Err(WebhookError::validation(format!("invalid event pattern `{s}`")));
            }
            // Keep the dot so `campaign.*` does not match `campaigns.x`.
            return Ok(EventPattern::Prefix(format!("{stem}.")));
        }
        if s.contains('*') {
            return Err(WebhookError::validation(format!(
                "wildcards are only allowed as a trailing `.*` (got `{s}`)"
            )));
        }
        Ok(EventPattern::Exact(s.to_string()))
    }
}

impl TryFrom<String> for EventPattern {
    type Error = WebhookError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventPattern> for String {
    fn from(value: EventPattern) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPattern::Any => f.write_str("*"),
            EventPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            EventPattern::Exact(exact) => f.write_str(exact),
        }
    }
}

/// Media type of the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContentType {
    #[default]
    Json,
    FormUrlEncoded,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
        }
    }
}

impl FromStr for ContentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "application/json" | "json" => Ok(ContentType::Json),
            "application/x-www-form-urlencoded" | "form" => Ok(ContentType::FormUrlEncoded),
            other => Err(DomainError::validation(format!("unsupported content type: {other}"))),
        }
    }
}

impl TryFrom<String> for ContentType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentType> for String {
    fn from(value: ContentType) -> Self {
        value.as_str().to_string()
    }
}

/// Extra request headers configured by the tenant.
///
/// Validated on construction: names must be HTTP tokens, values must not
/// contain control characters, and protocol headers (signature, timestamp,
/// content type, user agent, ...) can never be overridden.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct CustomHeaders(BTreeMap<String, String>);

impl CustomHeaders {
    pub fn new(headers: BTreeMap<String, String>) -> Result<Self, WebhookError> {
        for (name, value) in &headers {
            if name.is_empty() || !name.bytes().all(is_token_byte) {
                return Err(WebhookError::InvalidHeader(format!("invalid header name `{name}`")));
            }
            if protocol::is_reserved_header(name) {
                return Err(WebhookError::ReservedHeader(name.clone()));
            }
            if !value.bytes().all(|b| b == b'\t' || (0x20..0x7f).contains(&b)) {
                return Err(WebhookError::InvalidHeader(format!(
                    "invalid value for header `{name}`"
                )));
            }
        }
        Ok(Self(headers))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl TryFrom<BTreeMap<String, String>> for CustomHeaders {
    type Error = WebhookError;

    fn try_from(value: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CustomHeaders> for BTreeMap<String, String> {
    fn from(value: CustomHeaders) -> Self {
        value.0
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Advisory delivery telemetry, mutated after every attempt.
///
/// Concurrent attempts may race on these values; last writer wins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryHealth {
    pub consecutive_failure_count: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DeliveryHealth {
    /// Percentage of successful attempts, `None` before the first attempt.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return None;
        }
        Some((self.success_count as f64 / total as f64 * 10_000.0).round() / 100.0)
    }
}

/// Input for registering a new endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWebhookConfig {
    pub name: String,
    pub callback_url: String,
    #[serde(default)]
    pub subscribed_events: Vec<String>,
    #[serde(default)]
    pub platform_filter: Option<String>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
}

/// Partial update of an existing endpoint. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfigUpdate {
    pub name: Option<String>,
    pub callback_url: Option<String>,
    pub subscribed_events: Option<Vec<String>>,
    /// `Some(None)` clears the filter.
    pub platform_filter: Option<Option<String>>,
    pub content_type: Option<ContentType>,
    pub custom_headers: Option<BTreeMap<String, String>>,
    pub timeout_seconds: Option<u32>,
    pub is_active: Option<bool>,
}

/// A registered webhook endpoint and its delivery preferences.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: WebhookConfigId,
    pub org_id: OrgId,
    pub name: String,
    pub callback_url: String,
    /// Shared signing key. Never transmitted.
    pub secret: String,
    pub verify_token: String,
    /// Empty means every event type.
    pub subscribed_events: Vec<EventPattern>,
    pub platform_filter: Option<String>,
    pub content_type: ContentType,
    pub custom_headers: CustomHeaders,
    pub timeout_seconds: u32,
    pub is_active: bool,
    pub is_verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub health: DeliveryHealth,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("id", &self.id)
            .field("org_id", &self.org_id)
            .field("name", &self.name)
            .field("callback_url", &self.callback_url)
            .field("secret", &"<redacted>")
            .field("verify_token", &"<redacted>")
            .field("subscribed_events", &self.subscribed_events)
            .field("platform_filter", &self.platform_filter)
            .field("content_type", &self.content_type)
            .field("custom_headers", &self.custom_headers)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("is_active", &self.is_active)
            .field("is_verified", &self.is_verified)
            .field("verified_at", &self.verified_at)
            .field("health", &self.health)
            .finish()
    }
}

impl WebhookConfig {
    /// Validate input and create a new endpoint.
    ///
    /// Secrets are generated here. New endpoints start inactive and
    /// unverified; they receive nothing until the handshake succeeds and the
    /// tenant activates them.
    pub fn register(
        org_id: OrgId,
        input: NewWebhookConfig,
        rules: RegistrationRules,
        now: DateTime<Utc>,
    ) -> Result<Self, WebhookError> {
        let name = validate_name(&input.name)?;
        let callback_url = validate_callback_url(&input.callback_url, rules)?;
        let subscribed_events = parse_patterns(&input.subscribed_events)?;
        let platform_filter = validate_platform(input.platform_filter)?;
        let custom_headers = CustomHeaders::new(input.custom_headers)?;
        let timeout_seconds =
            validate_timeout(input.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS))?;

        Ok(Self {
            id: WebhookConfigId::new(),
            org_id,
            name,
            callback_url,
            secret: random_hex(TOKEN_BYTES),
            verify_token: random_hex(TOKEN_BYTES),
            subscribed_events,
            platform_filter,
            content_type: input.content_type.unwrap_or_default(),
            custom_headers,
            timeout_seconds,
            is_active: false,
            is_verified: false,
            verified_at: None,
            health: DeliveryHealth::default(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Deliveries (first attempts and retries) are only made while this holds.
    pub fn can_deliver(&self) -> bool {
        self.is_active && self.is_verified
    }

    /// Whether this endpoint wants `event_type` (optionally from `platform`).
    pub fn accepts(&self, event_type: &str, platform: Option<&str>) -> bool {
        let event_ok = self.subscribed_events.is_empty()
            || self.subscribed_events.iter().any(|p| p.matches(event_type));

        let platform_ok = match (platform, self.platform_filter.as_deref()) {
            (Some(requested), Some(filter)) => requested == filter,
            _ => true,
        };

        event_ok && platform_ok
    }

    /// Exact event types and the platform filter that are not in the catalog.
    /// They are accepted; an unknown name is usually a typo.
    pub fn uncatalogued(&self) -> Vec<&str> {
        let events = self.subscribed_events.iter().filter_map(|pattern| match pattern {
            EventPattern::Exact(event_type) if !catalog::is_known_event_type(event_type) => {
                Some(event_type.as_str())
            }
            _ => None,
        });
        let platform = self
            .platform_filter
            .as_deref()
            .filter(|platform| !catalog::is_known_platform(platform));
        events.chain(platform).collect()
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.timeout_seconds))
    }

    /// Record a successful handshake. The only way `is_verified` becomes true.
    pub fn mark_verified(&mut self, now: DateTime<Utc>) {
        self.is_verified = true;
        self.verified_at = Some(now);
        self.updated_at = now;
    }

    pub fn set_active(&mut self, active: bool, now: DateTime<Utc>) -> Result<(), WebhookError> {
        if active && !self.is_verified {
            return Err(WebhookError::NotVerified);
        }
        self.is_active = active;
        self.updated_at = now;
        Ok(())
    }

    pub fn toggle_active(&mut self, now: DateTime<Utc>) -> Result<bool, WebhookError> {
        self.set_active(!self.is_active, now)?;
        Ok(self.is_active)
    }

    /// Apply a partial update atomically: nothing changes unless every field
    /// validates.
    ///
    /// A new callback URL voids the previous handshake and deactivates the
    /// endpoint, overriding any activation requested in the same update.
    pub fn apply_update(
        &mut self,
        update: WebhookConfigUpdate,
        rules: RegistrationRules,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let name = update.name.as_deref().map(validate_name).transpose()?;
        let callback_url = update
            .callback_url
            .as_deref()
            .map(|url| validate_callback_url(url, rules))
            .transpose()?;
        let subscribed_events = update
            .subscribed_events
            .as_deref()
            .map(parse_patterns)
            .transpose()?;
        let platform_filter = update.platform_filter.map(validate_platform).transpose()?;
        let custom_headers = update.custom_headers.map(CustomHeaders::new).transpose()?;
        let timeout_seconds = update.timeout_seconds.map(validate_timeout).transpose()?;

        let url_changed = callback_url
            .as_ref()
            .is_some_and(|url| *url != self.callback_url);

        if !url_changed && update.is_active == Some(true) && !self.is_verified {
            return Err(WebhookError::NotVerified);
        }

        if let Some(name) = name {
            self.name = name;
        }
        if let Some(url) = callback_url {
            self.callback_url = url;
        }
        if let Some(patterns) = subscribed_events {
            self.subscribed_events = patterns;
        }
        if let Some(platform) = platform_filter {
            self.platform_filter = platform;
        }
        if let Some(content_type) = update.content_type {
            self.content_type = content_type;
        }
        if let Some(headers) = custom_headers {
            self.custom_headers = headers;
        }
        if let Some(timeout) = timeout_seconds {
            self.timeout_seconds = timeout;
        }

        if url_changed {
            self.is_verified = false;
            self.verified_at = None;
            self.is_active = false;
        } else if let Some(active) = update.is_active {
            self.is_active = active;
        }

        self.updated_at = now;
        Ok(())
    }

    /// Issue a new verify token; the endpoint must complete the handshake again.
    pub fn regenerate_verify_token(&mut self, now: DateTime<Utc>) -> &str {
        self.verify_token = random_hex(TOKEN_BYTES);
        self.is_verified = false;
        self.verified_at = None;
        self.updated_at = now;
        &self.verify_token
    }

    pub fn regenerate_secret(&mut self, now: DateTime<Utc>) -> &str {
        self.secret = random_hex(TOKEN_BYTES);
        self.updated_at = now;
        &self.secret
    }

    pub fn record_triggered(&mut self, now: DateTime<Utc>) {
        self.health.last_triggered_at = Some(now);
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.health.consecutive_failure_count = 0;
        self.health.success_count += 1;
        self.health.last_success_at = Some(now);
    }

    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.health.consecutive_failure_count =
            self.health.consecutive_failure_count.saturating_add(1);
        self.health.failure_count += 1;
        self.health.last_failure_at = Some(now);
        self.health.last_error = Some(error.to_string());
    }
}

fn validate_name(name: &str) -> Result<String, WebhookError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(WebhookError::validation("name is required"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(WebhookError::validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

/// Parse and validate a callback URL.
pub fn validate_callback_url(raw: &str, rules: RegistrationRules) -> Result<String, WebhookError> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LEN {
        return Err(WebhookError::InvalidUrl(format!(
            "must be at most {MAX_URL_LEN} characters"
        )));
    }

    let parsed = url::Url::parse(raw).map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "https" => {}
        "http" if rules.allow_http => {}
        "http" => return Err(WebhookError::InvalidUrl("callback URLs must use https".to_string())),
        other => {
            return Err(WebhookError::InvalidUrl(format!("unsupported scheme `{other}`")));
        }
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(WebhookError::InvalidUrl("URL must have a host".to_string()));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(WebhookError::InvalidUrl("URL must not embed credentials".to_string()));
    }

    Ok(raw.to_string())
}

fn parse_patterns(raw: &[String]) -> Result<Vec<EventPattern>, WebhookError> {
    let mut patterns: Vec<EventPattern> = Vec::with_capacity(raw.len());
    for p in raw {
        let pattern: EventPattern = p.parse()?;
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }
    Ok(patterns)
}

fn validate_platform(platform: Option<String>) -> Result<Option<String>, WebhookError> {
    match platform.map(|p| p.trim().to_string()) {
        Some(p) if p.is_empty() => Ok(None),
        Some(p) if p.chars().any(char::is_whitespace) => Err(WebhookError::validation(format!(
            "platform `{p}` must not contain whitespace"
        ))),
        other => Ok(other),
    }
}

fn validate_timeout(timeout: u32) -> Result<u32, WebhookError> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout) {
        return Err(WebhookError::validation(format!(
            "timeout_seconds must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS}"
        )));
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn input() -> NewWebhookConfig {
        NewWebhookConfig {
            name: "Orders".to_string(),
            callback_url: "https://hooks.example.com/cmis".to_string(),
            subscribed_events: vec!["order.created".to_string(), "campaign.*".to_string()],
            ..Default::default()
        }
    }

    fn registered() -> WebhookConfig {
        WebhookConfig::register(OrgId::new(), input(), RegistrationRules::default(), now()).unwrap()
    }

    #[test]
    fn register_generates_secrets_and_starts_disabled() {
        let config = registered();
        assert_eq!(config.secret.len(), 64);
        assert_eq!(config.verify_token.len(), 64);
        assert_ne!(config.secret, config.verify_token);
        assert!(!config.is_active);
        assert!(!config.is_verified);
        assert!(!config.can_deliver());
        assert_eq!(config.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.content_type, ContentType::Json);
    }

    #[test]
    fn uncatalogued_names_are_reported() {
        let mut config = registered();
        assert_eq!(config.uncatalogued(), vec!["order.created"]);

        config.subscribed_events = vec![
            "campaign.created".parse().unwrap(),
            "report.*".parse().unwrap(),
            "*".parse().unwrap(),
        ];
        config.platform_filter = Some("meta".to_string());
        assert!(config.uncatalogued().is_empty());

        config.platform_filter = Some("myspace".to_string());
        assert_eq!(config.uncatalogued(), vec!["myspace"]);
    }

    #[test]
    fn register_rejects_bad_input() {
        let rules = RegistrationRules::default();
        let org = OrgId::new();

        let mut bad = input();
        bad.callback_url = "http://hooks.example.com".to_string();
        assert!(matches!(
            WebhookConfig::register(org, bad, rules, now()),
            Err(WebhookError::InvalidUrl(_))
        ));

        let mut bad = input();
        bad.callback_url = "not a url".to_string();
        assert!(WebhookConfig::register(org, bad, rules, now()).is_err());

        let mut bad = input();
        bad.timeout_seconds = Some(120);
        assert!(matches!(
            WebhookConfig::register(org, bad, rules, now()),
            Err(WebhookError::Validation(_))
        ));

        let mut bad = input();
        bad.name = "   ".to_string();
        assert!(WebhookConfig::register(org, bad, rules, now()).is_err());

        let mut bad = input();
        bad.subscribed_events = vec!["order*".to_string()];
        assert!(WebhookConfig::register(org, bad, rules, now()).is_err());
    }

    #[test]
    fn http_allowed_when_rules_permit() {
        let mut dev = input();
        dev.callback_url = "http://127.0.0.1:9000/hook".to_string();
        let rules = RegistrationRules { allow_http: true };
        let config = WebhookConfig::register(OrgId::new(), dev, rules, now()).unwrap();
        assert_eq!(config.callback_url, "http://127.0.0.1:9000/hook");
    }

    #[test]
    fn custom_headers_cannot_override_protocol_headers() {
        for reserved in ["X-CMIS-Signature", "x-cmis-timestamp", "Content-Type", "User-Agent"] {
            let mut bad = input();
            bad.custom_headers.insert(reserved.to_string(), "spoof".to_string());
            assert_eq!(
                WebhookConfig::register(OrgId::new(), bad, RegistrationRules::default(), now())
                    .unwrap_err(),
                WebhookError::ReservedHeader(reserved.to_string())
            );
        }
    }

    #[test]
    fn custom_headers_reject_injection() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Ok".to_string(), "line\r\nX-Evil: 1".to_string());
        assert!(matches!(CustomHeaders::new(headers), Err(WebhookError::InvalidHeader(_))));

        let mut headers = BTreeMap::new();
        headers.insert("Bad Name".to_string(), "v".to_string());
        assert!(matches!(CustomHeaders::new(headers), Err(WebhookError::InvalidHeader(_))));
    }

    #[test]
    fn event_patterns_match_exact_prefix_and_any() {
        let exact: EventPattern = "order.created".parse().unwrap();
        assert!(exact.matches("order.created"));
        assert!(!exact.matches("order.created.v2"));

        let prefix: EventPattern = "campaign.*".parse().unwrap();
        assert!(prefix.matches("campaign.created"));
        assert!(prefix.matches("campaign.budget.exceeded"));
        assert!(!prefix.matches("campaigns.created"));
        assert!(!prefix.matches("campaign"));

        let any: EventPattern = "*".parse().unwrap();
        assert!(any.matches("anything"));
    }

    #[test]
    fn event_pattern_serializes_as_written() {
        let pattern: EventPattern = "campaign.*".parse().unwrap();
        assert_eq!(serde_json::to_string(&pattern).unwrap(), "\"campaign.*\"");
        let back: EventPattern = serde_json::from_str("\"campaign.*\"").unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn accepts_respects_events_and_platform() {
        let mut config = registered();
        assert!(config.accepts("order.created", None));
        assert!(config.accepts("campaign.updated", Some("meta")));
        assert!(!config.accepts("message.received", None));

        config.platform_filter = Some("meta".to_string());
        assert!(config.accepts("order.created", Some("meta")));
        assert!(!config.accepts("order.created", Some("google")));
        assert!(config.accepts("order.created", None));

        config.subscribed_events.clear();
        assert!(config.accepts("message.received", None));
    }

    #[test]
    fn activation_requires_verification() {
        let mut config = registered();
        assert_eq!(config.set_active(true, now()), Err(WebhookError::NotVerified));

        config.mark_verified(now());
        assert!(config.toggle_active(now()).unwrap());
        assert!(config.can_deliver());

        assert!(!config.toggle_active(now()).unwrap());
        assert!(!config.can_deliver());
    }

    #[test]
    fn changing_url_voids_verification() {
        let mut config = registered();
        config.mark_verified(now());
        config.set_active(true, now()).unwrap();

        config
            .apply_update(
                WebhookConfigUpdate {
                    callback_url: Some("https://new.example.com/hook".to_string()),
                    is_active: Some(true),
                    ..Default::default()
                },
                RegistrationRules::default(),
                now(),
            )
            .unwrap();

        assert!(!config.is_verified);
        assert!(!config.is_active);
        assert!(config.verified_at.is_none());
    }

    #[test]
    fn update_is_all_or_nothing() {
        let mut config = registered();
        let before = config.clone();

        let err = config
            .apply_update(
                WebhookConfigUpdate {
                    name: Some("Renamed".to_string()),
                    timeout_seconds: Some(1),
                    ..Default::default()
                },
                RegistrationRules::default(),
                now(),
            )
            .unwrap_err();

        assert!(matches!(err, WebhookError::Validation(_)));
        assert_eq!(config, before);
    }

    #[test]
    fn update_cannot_activate_unverified() {
        let mut config = registered();
        let err = config
            .apply_update(
                WebhookConfigUpdate {
                    is_active: Some(true),
                    ..Default::default()
                },
                RegistrationRules::default(),
                now(),
            )
            .unwrap_err();
        assert_eq!(err, WebhookError::NotVerified);
    }

    #[test]
    fn regenerating_token_requires_new_handshake() {
        let mut config = registered();
        config.mark_verified(now());
        let old = config.verify_token.clone();

        let new = config.regenerate_verify_token(now()).to_string();
        assert_ne!(new, old);
        assert!(!config.is_verified);
    }

    #[test]
    fn regenerating_secret_keeps_verification() {
        let mut config = registered();
        config.mark_verified(now());
        let old = config.secret.clone();

        config.regenerate_secret(now());
        assert_ne!(config.secret, old);
        assert!(config.is_verified);
    }

    #[test]
    fn health_counters_track_attempts() {
        let mut config = registered();
        assert_eq!(config.health.success_rate(), None);

        config.record_failure("HTTP 500", now());
        config.record_failure("HTTP 502", now());
        assert_eq!(config.health.consecutive_failure_count, 2);
        assert_eq!(config.health.last_error.as_deref(), Some("HTTP 502"));

        config.record_success(now());
        assert_eq!(config.health.consecutive_failure_count, 0);
        assert_eq!(config.health.success_count, 1);
        assert_eq!(config.health.failure_count, 2);
        assert_eq!(config.health.success_rate(), Some(33.33));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = registered();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains(&config.secret));
        assert!(!rendered.contains(&config.verify_token));
    }
}
