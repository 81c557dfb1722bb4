//! Endpoint ownership handshake.
//!
//! `GET <callback_url>?hub_mode=subscribe&hub_verify_token=<token>&hub_challenge=<hex>`
//! must answer 2xx with the challenge as its body (surrounding whitespace is
//! ignored). Single-shot: never retried automatically.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use cmis_webhooks::WebhookConfig;
use cmis_webhooks::protocol::{
    HUB_CHALLENGE_PARAM, HUB_MODE_PARAM, HUB_MODE_SUBSCRIBE, HUB_VERIFY_TOKEN_PARAM,
};
use cmis_webhooks::signer::random_hex;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::WebhookStore;
use crate::transport::{HttpResponse, HttpTransport, OutboundRequest};

/// Random bytes in a handshake challenge.
pub const CHALLENGE_BYTES: usize = 16;

/// Bytes of the handshake response read before giving up on the rest.
pub const CHALLENGE_RESPONSE_LIMIT: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub success: bool,
    pub message: String,
}

impl VerificationResult {
    fn ok() -> Self {
        Self {
            success: true,
            message: "endpoint verified".to_string(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub struct Verifier<S, T> {
    store: S,
    transport: T,
    clock: Arc<dyn Clock>,
}

impl<S: WebhookStore, T: HttpTransport> Verifier<S, T> {
    pub fn new(store: S, transport: T, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            transport,
            clock,
        }
    }

    /// Run the handshake against `config.callback_url`.
    ///
    /// On success the configuration is marked verified in the store, unless
    /// its callback URL or verify token changed while the handshake was in
    /// flight; that is reported as a failure. On failure nothing is written;
    /// an already verified configuration stays verified. Only storage errors
    /// are returned as `Err`.
    pub async fn verify(&self, config: &WebhookConfig) -> Result<VerificationResult, StoreError> {
        let challenge = random_hex(CHALLENGE_BYTES);
        let request = OutboundRequest::get(config.callback_url.clone(), config.timeout())
            .query(HUB_MODE_PARAM, HUB_MODE_SUBSCRIBE)
            .query(HUB_VERIFY_TOKEN_PARAM, config.verify_token.clone())
            .query(HUB_CHALLENGE_PARAM, challenge.clone())
            .max_body_bytes(CHALLENGE_RESPONSE_LIMIT);

        let outcome = match self.transport.send(request).await {
            Ok(response) => check_challenge(&response, &challenge),
            Err(e) => Err(format!("verification request failed: {e}")),
        };

        match outcome {
            Ok(()) => {
                let now = self.clock.now();
                let verified = self
                    .store
                    .mark_verified(
                        config.org_id,
                        config.id,
                        &config.callback_url,
                        &config.verify_token,
                        now,
                    )
                    .await?;
                if !verified {
                    warn!(
                        target: "webhook_delivery",
                        org_id = %config.org_id,
                        webhook_config_id = %config.id,
                        "webhook configuration changed during verification"
                    );
                    return Ok(VerificationResult::failed(
                        "callback URL or verify token changed during verification; verify again",
                    ));
                }
                info!(
                    target: "webhook_delivery",
                    org_id = %config.org_id,
                    webhook_config_id = %config.id,
                    "webhook endpoint verified"
                );
                Ok(VerificationResult::ok())
            }
            Err(message) => {
                warn!(
                    target: "webhook_delivery",
                    org_id = %config.org_id,
                    webhook_config_id = %config.id,
                    reason = %message,
                    "webhook endpoint verification failed"
                );
                Ok(VerificationResult::failed(message))
            }
        }
    }
}

/// A handshake response passes when it is 2xx and its trimmed body equals
/// the challenge exactly.
pub fn check_challenge(response: &HttpResponse, challenge: &str) -> Result<(), String> {
    if !response.is_success() {
        return Err(format!(
            "endpoint returned HTTP {} during verification",
            response.status
        ));
    }
    if response.body.trim() != challenge {
        return Err(format!(
            "endpoint did not echo the challenge \
             (expected the `{HUB_CHALLENGE_PARAM}` value as the response body)"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: BTreeMap::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn exact_echo_passes() {
        assert!(check_challenge(&response(200, "abc123"), "abc123").is_ok());
        assert!(check_challenge(&response(204, "\n abc123 \r\n"), "abc123").is_ok());
    }

    #[test]
    fn extra_content_fails() {
        assert!(check_challenge(&response(200, "abc123x"), "abc123").is_err());
        assert!(check_challenge(&response(200, "ok abc123"), "abc123").is_err());
        assert!(check_challenge(&response(200, ""), "abc123").is_err());
    }

    #[test]
    fn non_success_status_fails_even_with_echo() {
        let err = check_challenge(&response(404, "abc123"), "abc123").unwrap_err();
        assert!(err.contains("404"));
    }
}
