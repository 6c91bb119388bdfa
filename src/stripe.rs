// Stripe Gateway - REST Client and Webhook Signature Verification
// Form-encoded calls to the payment processor; HMAC-SHA256 over raw webhook bytes

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::core::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamps older or newer than this many seconds are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePaymentIntent {
    pub id: String,
    pub status: Option<String>,
}

/// Webhook event envelope; `data.object` stays dynamic because each event
/// type carries a different object shape.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

impl StripeEvent {
    pub fn from_bytes(bytes: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| BillingError::WebhookSignature(format!("unparseable event body: {e}")))
    }
}

/// One line item for a checkout session: either a pre-created Stripe price or
/// an inline dynamic price (wallet topups).
#[derive(Debug, Clone)]
pub enum SessionLineItem {
    Price { price_id: String, quantity: i64 },
    Dynamic {
        name: String,
        currency: String,
        amount_minor: i64,
        quantity: i64,
    },
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionParams {
    pub mode: &'static str,
    pub customer: String,
    pub line_items: Vec<SessionLineItem>,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: Vec<(String, String)>,
    pub payment_intent_metadata: Vec<(String, String)>,
}

/// Stripe subscription status to the domain's subscription status.
pub fn map_subscription_status(stripe_status: &str) -> &'static str {
    match stripe_status {
        "active" => "ACTIVE",
        "past_due" => "PAST_DUE",
        "canceled" => "CANCELED",
        "incomplete" => "INCOMPLETE",
        "trialing" => "TRIALING",
        "unpaid" => "UNPAID",
        _ => "ACTIVE",
    }
}

// Thin REST client over reqwest; the base URL is injectable for tests
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(secret_key: String, webhook_secret: String, api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            webhook_secret,
            api_base,
        }
    }

    pub async fn create_customer(
        &self,
        name: &str,
        metadata: &[(String, String)],
    ) -> BillingResult<StripeCustomer> {
        let mut form: Vec<(String, String)> = vec![("name".to_string(), name.to_string())];
        for (key, value) in metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        self.post_form("/v1/customers", &form).await
    }

    pub async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
    ) -> BillingResult<StripeCheckoutSession> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".to_string(), params.mode.to_string()),
            ("customer".to_string(), params.customer.clone()),
            ("success_url".to_string(), params.success_url.clone()),
            ("cancel_url".to_string(), params.cancel_url.clone()),
        ];

        for (index, item) in params.line_items.iter().enumerate() {
            match item {
                SessionLineItem::Price { price_id, quantity } => {
                    form.push((format!("line_items[{index}][price]"), price_id.clone()));
                    form.push((format!("line_items[{index}][quantity]"), quantity.to_string()));
                }
                SessionLineItem::Dynamic {
                    name,
                    currency,
                    amount_minor,
                    quantity,
                } => {
                    form.push((
                        format!("line_items[{index}][price_data][currency]"),
                        currency.to_lowercase(),
                    ));
                    form.push((
                        format!("line_items[{index}][price_data][product_data][name]"),
                        name.clone(),
                    ));
                    form.push((
                        format!("line_items[{index}][price_data][unit_amount]"),
                        amount_minor.to_string(),
                    ));
                    form.push((format!("line_items[{index}][quantity]"), quantity.to_string()));
                }
            }
        }

        for (key, value) in &params.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }
        for (key, value) in &params.payment_intent_metadata {
            form.push((
                format!("payment_intent_data[metadata][{key}]"),
                value.clone(),
            ));
        }

        self.post_form("/v1/checkout/sessions", &form).await
    }

    /// Non-interactive charge against a saved customer; used by auto-topup.
    pub async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        customer: &str,
        metadata: &[(String, String)],
    ) -> BillingResult<StripePaymentIntent> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), amount_minor.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("customer".to_string(), customer.to_string()),
            ("confirm".to_string(), "true".to_string()),
            ("off_session".to_string(), "true".to_string()),
        ];
        for (key, value) in metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        self.post_form("/v1/payment_intents", &form).await
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> BillingResult<T> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| BillingError::Stripe(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Stripe(format!(
                "{path} returned {status}: {body}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BillingError::Stripe(format!("unparseable response from {path}: {e}")))
    }

    /// Verify the `stripe-signature` header against the raw body bytes.
    pub fn verify_signature(&self, raw_body: &[u8], sig_header: &str) -> BillingResult<()> {
        verify_signature_at(
            &self.webhook_secret,
            raw_body,
            sig_header,
            Utc::now().timestamp(),
        )
    }

}

/// The header is `t=<unix>,v1=<hex hmac>[,..]`; the MAC covers
/// `"{t}.{raw_body}"`. Comparison is the Mac's constant-time verify.
pub fn verify_signature_at(
    secret: &str,
    raw_body: &[u8],
    sig_header: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in sig_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| BillingError::WebhookSignature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(BillingError::WebhookSignature(
            "missing v1 signature".to_string(),
        ));
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::WebhookSignature(
            "timestamp outside tolerance".to_string(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignature("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);

    for candidate in signatures {
        let Ok(decoded) = hex::decode(candidate) else {
            continue;
        };
        if mac.clone().verify_slice(&decoded).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::WebhookSignature(
        "no matching v1 signature".to_string(),
    ))
}

pub fn sign_payload(secret: &str, raw_body: &[u8], timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign_payload("whsec_test", body, 1_700_000_000);
        assert!(verify_signature_at("whsec_test", body, &header, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let header = sign_payload("whsec_test", b"original", 1_700_000_000);
        let err = verify_signature_at("whsec_test", b"tampered", &header, 1_700_000_000);
        assert!(err.is_err());
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let header = sign_payload("whsec_one", b"body", 1_700_000_000);
        assert!(verify_signature_at("whsec_two", b"body", &header, 1_700_000_000).is_err());
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let header = sign_payload("whsec_test", b"body", 1_700_000_000);
        let err = verify_signature_at(
            "whsec_test",
            b"body",
            &header,
            1_700_000_000 + SIGNATURE_TOLERANCE_SECS + 1,
        );
        assert!(matches!(err, Err(BillingError::WebhookSignature(_))));
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        assert!(verify_signature_at("s", b"body", "", 0).is_err());
        assert!(verify_signature_at("s", b"body", "t=abc,v1=00", 0).is_err());
        assert!(verify_signature_at("s", b"body", "t=0", 0).is_err());
    }

    #[test]
    fn test_signature_accepts_any_matching_v1() {
        let body = b"payload";
        let good = sign_payload("whsec", body, 100);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t=100,v1=deadbeef,v1={good_sig}");
        assert!(verify_signature_at("whsec", body, &header, 100).is_ok());
    }

    #[test]
    fn test_subscription_status_mapping() {
        assert_eq!(map_subscription_status("active"), "ACTIVE");
        assert_eq!(map_subscription_status("past_due"), "PAST_DUE");
        assert_eq!(map_subscription_status("canceled"), "CANCELED");
        assert_eq!(map_subscription_status("incomplete"), "INCOMPLETE");
        assert_eq!(map_subscription_status("trialing"), "TRIALING");
        assert_eq!(map_subscription_status("unpaid"), "UNPAID");
        assert_eq!(map_subscription_status("anything-else"), "ACTIVE");
    }

    #[test]
    fn test_event_envelope_parses() {
        let event = StripeEvent::from_bytes(
            br#"{"id":"evt_9","type":"checkout.session.completed","data":{"object":{"id":"cs_1"}}}"#,
        )
        .unwrap();
        assert_eq!(event.id, "evt_9");
        assert_eq!(event.event_type, "checkout.session.completed");
        assert_eq!(event.data.object["id"], json!("cs_1"));
    }

    fn client_for(base: String) -> StripeClient {
        StripeClient::new("sk_test_123".to_string(), "whsec_test".to_string(), base)
    }

    #[tokio::test]
    async fn test_create_customer_posts_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/customers"))
            .and(body_string_contains("name=Acme+Robotics"))
            .and(body_string_contains("metadata%5BteamId%5D=team-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_42"})))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let customer = client
            .create_customer(
                "Acme Robotics",
                &[("teamId".to_string(), "team-1".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(customer.id, "cus_42");
    }

    #[tokio::test]
    async fn test_create_checkout_session_encodes_line_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(body_string_contains("mode=subscription"))
            .and(body_string_contains("line_items%5B0%5D%5Bprice%5D=price_base"))
            .and(body_string_contains("line_items%5B1%5D%5Bquantity%5D=3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.test/cs_test_1",
            })))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let session = client
            .create_checkout_session(&CheckoutSessionParams {
                mode: "subscription",
                customer: "cus_42".to_string(),
                line_items: vec![
                    SessionLineItem::Price {
                        price_id: "price_base".to_string(),
                        quantity: 1,
                    },
                    SessionLineItem::Price {
                        price_id: "price_seat".to_string(),
                        quantity: 3,
                    },
                ],
                success_url: "https://app.example/ok".to_string(),
                cancel_url: "https://app.example/no".to_string(),
                metadata: vec![("teamId".to_string(), "team-1".to_string())],
                payment_intent_metadata: vec![],
            })
            .await
            .unwrap();
        assert_eq!(session.id, "cs_test_1");
        assert_eq!(
            session.url.as_deref(),
            Some("https://checkout.stripe.test/cs_test_1")
        );
    }

    #[tokio::test]
    async fn test_api_error_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(json!({
                    "error": {"message": "Your card was declined."}
                })),
            )
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let err = client
            .create_payment_intent(5000, "USD", "cus_42", &[])
            .await
            .unwrap_err();
        match err {
            BillingError::Stripe(message) => {
                assert!(message.contains("402"));
                assert!(message.contains("declined"));
            }
            other => panic!("expected Stripe error, got {other:?}"),
        }
    }
}
