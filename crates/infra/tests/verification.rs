//! Ownership handshake against live endpoints.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cmis_core::{OrgId, WebhookConfigId};
use cmis_infra::transport::HttpResponse;
use cmis_infra::{
    Clock, HttpTransport, OutboundRequest, ServiceError, TransportError, Verifier, WebhookStore,
};
use cmis_webhooks::{WebhookConfig, WebhookConfigUpdate};

use common::*;

#[tokio::test]
async fn echoed_challenge_marks_config_verified() {
    let server = MockServer::start().await;
    let h = Harness::new();
    let org = OrgId::new();
    let config = h.pending_config(org, &server.uri(), &["*"]).await;

    Mock::given(method("GET"))
        .and(query_param("hub_mode", "subscribe"))
        .and(query_param("hub_verify_token", config.verify_token.as_str()))
        .respond_with(EchoChallenge { suffix: "" })
        .expect(1)
        .mount(&server)
        .await;

    let result = h.registry().verify(org, config.id).await.unwrap();
    assert!(result.success, "{}", result.message);

    let stored = h.store.get_config(org, config.id).await.unwrap().unwrap();
    assert!(stored.is_verified);
    assert_eq!(stored.verified_at, Some(t0()));
    // Verification alone does not activate.
    assert!(!stored.is_active);

    let requests = server.received_requests().await.unwrap();
    let challenge = requests[0]
        .url
        .query_pairs()
        .find(|(k, _)| k == "hub_challenge")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert_eq!(challenge.len(), 32);
}

#[tokio::test]
async fn surrounding_whitespace_is_tolerated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(EchoChallenge { suffix: "\n" })
        .mount(&server)
        .await;

    let h = Harness::new();
    let org = OrgId::new();
    let config = h.pending_config(org, &server.uri(), &["*"]).await;

    assert!(h.registry().verify(org, config.id).await.unwrap().success);
}

#[tokio::test]
async fn extra_content_fails_verification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(EchoChallenge { suffix: "-extra" })
        .mount(&server)
        .await;

    let h = Harness::new();
    let org = OrgId::new();
    let config = h.pending_config(org, &server.uri(), &["*"]).await;

    let result = h.registry().verify(org, config.id).await.unwrap();
    assert!(!result.success);

    let stored = h.store.get_config(org, config.id).await.unwrap().unwrap();
    assert!(!stored.is_verified);
    assert!(stored.verified_at.is_none());
}

#[tokio::test]
async fn error_status_fails_even_when_body_matches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let h = Harness::new();
    let org = OrgId::new();
    let config = h.pending_config(org, &server.uri(), &["*"]).await;

    let result = h.registry().verify(org, config.id).await.unwrap();
    assert!(!result.success);
    assert!(result.message.contains("403"), "{}", result.message);
}

#[tokio::test]
async fn failed_reverification_keeps_existing_verification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = Harness::new();
    let org = OrgId::new();
    let config = h.active_config(org, &server.uri(), &["*"]).await;

    let result = h.registry().verify(org, config.id).await.unwrap();
    assert!(!result.success);

    let stored = h.store.get_config(org, config.id).await.unwrap().unwrap();
    assert!(stored.is_verified);
    assert!(stored.is_active);
}

#[tokio::test]
async fn unreachable_endpoint_reports_failure() {
    let url = {
        let server = MockServer::start().await;
        server.uri()
    };

    let h = Harness::new();
    let org = OrgId::new();
    let config = h.pending_config(org, &url, &["*"]).await;

    let result = h.registry().verify(org, config.id).await.unwrap();
    assert!(!result.success);
    assert!(result.message.starts_with("verification request failed"));
}

#[tokio::test]
async fn verifying_another_tenants_config_is_not_found() {
    let h = Harness::new();
    let config = h
        .pending_config(OrgId::new(), "http://127.0.0.1:9/hook", &["*"])
        .await;

    let err = h.registry().verify(OrgId::new(), config.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(id) if id == config.id));
}

/// Endpoint that echoes the challenge, but only after the configuration was
/// edited through the store.
struct EditedMidHandshake {
    store: Store,
    org_id: OrgId,
    id: WebhookConfigId,
    edit: fn(&mut WebhookConfig),
}

#[async_trait]
impl HttpTransport for EditedMidHandshake {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
        let mut config = self
            .store
            .get_config(self.org_id, self.id)
            .await
            .unwrap()
            .unwrap();
        (self.edit)(&mut config);
        self.store.update_config(&config).await.unwrap();

        let challenge = request
            .query
            .iter()
            .find(|(k, _)| k == "hub_challenge")
            .map(|(_, v)| v.clone())
            .unwrap();
        Ok(HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: challenge,
        })
    }
}

async fn verify_while_editing(edit: fn(&mut WebhookConfig)) -> (Harness, WebhookConfig) {
    let h = Harness::new();
    let org = OrgId::new();
    let config = h
        .pending_config(org, "https://crm.example.com/hook", &["*"])
        .await;
    let transport = EditedMidHandshake {
        store: h.store.clone(),
        org_id: org,
        id: config.id,
        edit,
    };
    let clock: Arc<dyn Clock> = Arc::new(h.clock.clone());
    let verifier = Verifier::new(h.store.clone(), transport, clock);

    let result = verifier.verify(&config).await.unwrap();
    assert!(!result.success);
    assert!(result.message.contains("changed during verification"), "{}", result.message);
    (h, config)
}

#[tokio::test]
async fn callback_url_changed_mid_handshake_is_not_verified() {
    let (h, config) = verify_while_editing(|config| {
        let update = WebhookConfigUpdate {
            callback_url: Some("https://attacker.example.net/hook".to_string()),
            ..Default::default()
        };
        config.apply_update(update, rules(), t0()).unwrap();
    })
    .await;

    let stored = h.store.get_config(config.org_id, config.id).await.unwrap().unwrap();
    assert_eq!(stored.callback_url, "https://attacker.example.net/hook");
    assert!(!stored.is_verified);
    assert!(stored.verified_at.is_none());
}

#[tokio::test]
async fn token_regenerated_mid_handshake_is_not_verified() {
    let (h, config) = verify_while_editing(|config| {
        config.regenerate_verify_token(t0());
    })
    .await;

    let stored = h.store.get_config(config.org_id, config.id).await.unwrap().unwrap();
    assert_ne!(stored.verify_token, config.verify_token);
    assert!(!stored.is_verified);
}
