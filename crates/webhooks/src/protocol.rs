//! Wire-level names shared by the verifier and the dispatcher.

/// HMAC-SHA256 of the exact request body, lowercase hex.
pub const SIGNATURE_HEADER: &str = "X-CMIS-Signature";
pub const EVENT_HEADER: &str = "X-CMIS-Event";
/// Unix epoch seconds at send time.
pub const TIMESTAMP_HEADER: &str = "X-CMIS-Timestamp";
/// Present on retries only; carries the current attempt number.
pub const RETRY_ATTEMPT_HEADER: &str = "X-CMIS-Retry-Attempt";

pub const DEFAULT_USER_AGENT: &str = "CMIS-Webhook/1.0";

/// Verification handshake query parameters.
pub const HUB_MODE_PARAM: &str = "hub_mode";
pub const HUB_VERIFY_TOKEN_PARAM: &str = "hub_verify_token";
pub const HUB_CHALLENGE_PARAM: &str = "hub_challenge";
pub const HUB_MODE_SUBSCRIBE: &str = "subscribe";

/// Headers a tenant may never set through `custom_headers`.
///
/// Anything starting with `x-cmis-` is reserved as well.
pub const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "user-agent",
    "host",
    "transfer-encoding",
    "connection",
];

pub const RESERVED_HEADER_PREFIX: &str = "x-cmis-";

pub fn is_reserved_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with(RESERVED_HEADER_PREFIX) || RESERVED_HEADERS.contains(&lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_headers_are_reserved_case_insensitively() {
        assert!(is_reserved_header(SIGNATURE_HEADER));
        assert!(is_reserved_header("x-cmis-timestamp"));
        assert!(is_reserved_header("X-CMIS-Anything"));
        assert!(is_reserved_header("Content-Type"));
        assert!(is_reserved_header("USER-AGENT"));
    }

    #[test]
    fn ordinary_headers_are_not_reserved() {
        assert!(!is_reserved_header("Authorization"));
        assert!(!is_reserved_header("X-Tenant-Ref"));
    }
}
