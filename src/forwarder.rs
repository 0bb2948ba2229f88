//! Single-attempt webhook delivery.
//!
//! A delivery either gets exactly status 200 back or is logged as failed
//! with enough context (status, request body, response body) to replay it
//! by hand. Nothing here retries.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{error, info, warn};

use crate::error::{DeliveryOutcome, FailureReason, RelayError, Result};
use crate::types::{Event, Subscription, Webhook};

const USER_AGENT: &str = concat!("webhook-relay/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct WebhookForwarder {
    client: reqwest::Client,
}

impl WebhookForwarder {
    /// Forwarder with a fresh client. No request timeout is applied.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RelayError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }

    /// Forwarder over an existing client, e.g. one with a timeout.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Deliver `event` to the subscription's webhook once.
    pub async fn deliver(&self, subscription: &Subscription, event: &Event) -> DeliveryOutcome {
        let webhook = &subscription.webhook;

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(subscription = %subscription.name, error = %err, "failed to serialize event");
                return DeliveryOutcome::Failed(FailureReason::Serialization(err.to_string()));
            }
        };

        let response = self
            .client
            .request(webhook.method.as_reqwest(), &webhook.url)
            .headers(build_headers(&subscription.name, webhook))
            .body(payload.clone())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!(
                    subscription = %subscription.name,
                    url = %webhook.url,
                    error = %err,
                    "error forwarding to webhook"
                );
                let reason = if err.is_timeout() {
                    FailureReason::Timeout
                } else {
                    FailureReason::Network(err.to_string())
                };
                return DeliveryOutcome::Failed(reason);
            }
        };

        let status = response.status().as_u16();
        if status != 200 {
            let body = match response.text().await {
                Ok(body) => body,
                Err(err) => format!("[failed to read response body: {err}]"),
            };
            error!(
                subscription = %subscription.name,
                url = %webhook.url,
                status,
                request = %String::from_utf8_lossy(&payload),
                response = %body,
                "webhook failed"
            );
            return DeliveryOutcome::Failed(FailureReason::Status { status, body });
        }

        info!(
            subscription = %subscription.name,
            cursor = ?event.cursor,
            url = %webhook.url,
            "forwarded event"
        );
        DeliveryOutcome::Delivered
    }
}

/// `content-type: application/json` overlaid with the configured headers.
/// Header names compare case-insensitively, so a configured `Content-Type`
/// replaces the default.
fn build_headers(subscription: &str, webhook: &Webhook) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in &webhook.headers {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_str(value).ok());
        match parsed {
            Some((name, value)) => {
                headers.insert(name, value);
            }
            None => warn!(subscription, header = %name, "skipping invalid webhook header"),
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, HttpMethod};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> Event {
        let mut payload = serde_json::Map::new();
        payload.insert("result".into(), json!([["0xfeed", 1]]));
        Event::new(payload).with_position(ChainId(8453), 77)
    }

    fn subscription(webhook: Webhook) -> Subscription {
        Subscription::new("test", 8453, "select 1", webhook, "unused")
    }

    #[test]
    fn configured_headers_override_content_type() {
        let webhook = Webhook::new("http://localhost")
            .with_header("Content-Type", "text/plain")
            .with_header("x-api-key", "abc")
            .with_header("bad header", "x");

        let headers = build_headers("test", &webhook);
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(headers["x-api-key"], "abc");
        assert_eq!(headers.len(), 2);
    }

    #[tokio::test]
    async fn delivers_with_default_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({ "cursor": { "8453": 77 }, "result": [["0xfeed", 1]] })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = WebhookForwarder::new().unwrap();
        let sub = subscription(Webhook::new(format!("{}/hook", server.uri())));

        assert_eq!(forwarder.deliver(&sub, &event()).await, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn uses_configured_method_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/hook"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = WebhookForwarder::new().unwrap();
        let webhook = Webhook::new(format!("{}/hook", server.uri()))
            .with_method(HttpMethod::Put)
            .with_header("authorization", "Bearer token");

        let outcome = forwarder.deliver(&subscription(webhook), &event()).await;
        assert!(outcome.is_delivered());
    }

    #[tokio::test]
    async fn non_200_is_a_failure_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;

        let forwarder = WebhookForwarder::new().unwrap();
        let sub = subscription(Webhook::new(server.uri()));

        assert_eq!(
            forwarder.deliver(&sub, &event()).await,
            DeliveryOutcome::Failed(FailureReason::Status {
                status: 503,
                body: "try later".into(),
            })
        );
    }

    #[tokio::test]
    async fn other_success_codes_still_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let forwarder = WebhookForwarder::new().unwrap();
        let outcome = forwarder
            .deliver(&subscription(Webhook::new(server.uri())), &event())
            .await;

        assert!(matches!(outcome, DeliveryOutcome::Failed(FailureReason::Status { status: 204, .. })));
    }

    #[tokio::test]
    async fn client_timeout_is_reported_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(50))
            .build()
            .unwrap();
        let forwarder = WebhookForwarder::with_client(client);
        let outcome = forwarder
            .deliver(&subscription(Webhook::new(server.uri())), &event())
            .await;

        assert_eq!(outcome, DeliveryOutcome::Failed(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_failure() {
        let forwarder = WebhookForwarder::new().unwrap();
        // Port 9 (discard) is not expected to be listening on loopback.
        let outcome = forwarder
            .deliver(&subscription(Webhook::new("http://127.0.0.1:9/hook")), &event())
            .await;

        assert!(matches!(outcome, DeliveryOutcome::Failed(FailureReason::Network(_))));
    }
}
