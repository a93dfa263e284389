//! Webhook payload parsing and signature verification.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "linear-signature";
/// Header carrying the unique delivery ID.
pub const DELIVERY_HEADER: &str = "linear-delivery";
/// Header carrying the event type.
pub const EVENT_HEADER: &str = "linear-event";

/// Verify Linear webhook signature using HMAC-SHA256.
///
/// # Arguments
/// * `body` - Raw webhook body bytes
/// * `signature` - Hex-encoded signature from `Linear-Signature` header
/// * `secret` - Webhook signing secret
///
/// # Returns
/// `true` if signature is valid, `false` otherwise. Malformed input is never
/// an error, just unverified.
#[must_use]
pub fn verify_webhook_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    if signature.is_empty() || secret.is_empty() {
        return false;
    }

    let Ok(signature_bytes) = hex::decode(signature.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison to prevent timing attacks
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Compute the hex signature Linear would send for `body`.
#[must_use]
pub fn sign_payload(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Validate webhook timestamp is within acceptable range.
///
/// # Arguments
/// * `timestamp_ms` - Webhook timestamp in milliseconds
/// * `max_age_ms` - Maximum age in milliseconds
///
/// # Returns
/// `true` if timestamp is valid, `false` if stale
#[must_use]
pub fn validate_webhook_timestamp(timestamp_ms: i64, max_age_ms: i64) -> bool {
    let now_ms = chrono::Utc::now().timestamp_millis();
    now_ms
        .checked_sub(timestamp_ms)
        .and_then(i64::checked_abs)
        .is_some_and(|age| age <= max_age_ms)
}

/// Errors raised while decoding a delivery body.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Body was empty
    #[error("Empty payload")]
    Empty,

    /// Body was not JSON or lacked a required field
    #[error("Invalid payload: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Event categories with a dedicated message template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Issue,
    Comment,
    Project,
    Cycle,
    Label,
    /// Any other type, rendered generically
    Other(String),
}

impl EventKind {
    /// Classify the payload's `type` field.
    #[must_use]
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "Issue" => Self::Issue,
            "Comment" => Self::Comment,
            "Project" => Self::Project,
            "Cycle" => Self::Cycle,
            "Label" | "IssueLabel" => Self::Label,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Main webhook payload structure
///
/// `type`, `action` and `data` are required; everything else is optional and
/// carried through for logging only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Action type (`create`, `update`, `remove`, ...)
    pub action: String,
    /// Event type (`Issue`, `Comment`, ...)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Entity fields, shape varies by event type
    pub data: Map<String, Value>,
    /// Timestamp when webhook was sent (milliseconds)
    #[serde(default)]
    pub webhook_timestamp: Option<i64>,
    /// Unique webhook ID
    #[serde(default)]
    pub webhook_id: Option<String>,
    /// Organization ID
    #[serde(default)]
    pub organization_id: Option<String>,
    /// Created at timestamp
    #[serde(default)]
    pub created_at: Option<String>,
    /// Previous values of changed fields (update events)
    #[serde(default)]
    pub updated_from: Option<Value>,
    /// URL of the subject entity
    #[serde(default)]
    pub url: Option<String>,
    /// Actor who triggered the event
    #[serde(default)]
    pub actor: Option<WebhookActor>,
}

/// Actor who triggered the webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookActor {
    /// Actor ID
    pub id: String,
    /// Actor type (user, `OauthClient`, Integration)
    #[serde(rename = "type", default)]
    pub actor_type: Option<String>,
    /// Actor name
    #[serde(default)]
    pub name: Option<String>,
}

impl WebhookPayload {
    /// Decode a raw delivery body.
    pub fn parse(body: &[u8]) -> Result<Self, PayloadError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(PayloadError::Empty);
        }
        Ok(serde_json::from_slice(body)?)
    }

    /// Template category for this event
    #[must_use]
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Entity ID from the data block
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

/// Parsed webhook headers
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    /// Unique delivery ID
    pub delivery_id: Option<String>,
    /// Event type
    pub event_type: Option<String>,
    /// HMAC signature
    pub signature: Option<String>,
}

impl WebhookHeaders {
    /// Parse headers from a request
    #[must_use]
    pub fn from_header_map(get_header: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            delivery_id: get_header(DELIVERY_HEADER),
            event_type: get_header(EVENT_HEADER),
            signature: get_header(SIGNATURE_HEADER),
        }
    }

    /// Delivery ID for log correlation
    #[must_use]
    pub fn delivery_id(&self) -> &str {
        self.delivery_id.as_deref().unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_webhook_signature_valid() {
        let body = b"test payload";
        let secret = "test-secret";

        // Compute expected signature
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_webhook_signature(body, &signature, secret));
        assert_eq!(sign_payload(body, secret), signature);
    }

    #[test]
    fn test_verify_webhook_signature_invalid() {
        let body = b"test payload";
        let secret = "test-secret";
        let wrong_signature = "0000000000000000000000000000000000000000000000000000000000000000";

        assert!(!verify_webhook_signature(body, wrong_signature, secret));
    }

    #[test]
    fn test_verify_webhook_signature_malformed() {
        let body = b"test payload";
        let secret = "test-secret";

        // Not valid hex
        assert!(!verify_webhook_signature(body, "not-hex", secret));
        // Truncated digest
        let truncated = &sign_payload(body, secret)[..32];
        assert!(!verify_webhook_signature(body, truncated, secret));
        // Missing pieces
        assert!(!verify_webhook_signature(body, "", secret));
        assert!(!verify_webhook_signature(body, &sign_payload(body, secret), ""));
    }

    #[test]
    fn test_single_bit_mutation_fails() {
        let body = br#"{"type":"Issue","action":"update","data":{"id":"abc"}}"#;
        let secret = "whsec_linear";
        let signature = sign_payload(body, secret);

        for byte in 0..body.len() {
            for bit in 0..8 {
                let mut mutated = body.to_vec();
                mutated[byte] ^= 1 << bit;
                assert!(
                    !verify_webhook_signature(&mutated, &signature, secret),
                    "mutation at byte {byte} bit {bit} verified"
                );
            }
        }
    }

    #[test]
    fn test_wrong_secret_fails() {
        let body = b"payload";
        let signature = sign_payload(body, "secret-a");
        assert!(!verify_webhook_signature(body, &signature, "secret-b"));
    }

    #[test]
    fn test_validate_timestamp_valid() {
        let now_ms = chrono::Utc::now().timestamp_millis();
        assert!(validate_webhook_timestamp(now_ms, 60_000));
        assert!(validate_webhook_timestamp(now_ms - 30_000, 60_000));
    }

    #[test]
    fn test_validate_timestamp_extremes() {
        assert!(!validate_webhook_timestamp(i64::MIN, 60_000));
        assert!(!validate_webhook_timestamp(i64::MAX, 60_000));
        assert!(!validate_webhook_timestamp(i64::MIN + 1, i64::MAX));
    }

    #[test]
    fn test_validate_timestamp_stale() {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let stale_ms = now_ms - 120_000; // 2 minutes ago
        assert!(!validate_webhook_timestamp(stale_ms, 60_000));
    }

    #[test]
    fn test_parse_webhook_payload() {
        let json = r#"{
            "action": "update",
            "type": "Issue",
            "createdAt": "2024-12-06T10:00:00.000Z",
            "webhookTimestamp": 1733482800000,
            "webhookId": "webhook-123",
            "updatedFrom": {"stateId": "old"},
            "data": {
                "id": "issue-789",
                "identifier": "TSK-1",
                "title": "Test Issue"
            },
            "actor": {"id": "user-1", "type": "user", "name": "Ada"}
        }"#;

        let payload = WebhookPayload::parse(json.as_bytes()).unwrap();

        assert_eq!(payload.action, "update");
        assert_eq!(payload.kind(), EventKind::Issue);
        assert_eq!(payload.entity_id(), Some("issue-789"));
        assert_eq!(payload.webhook_timestamp, Some(1_733_482_800_000));
        assert_eq!(
            payload.actor.as_ref().and_then(|a| a.name.as_deref()),
            Some("Ada")
        );
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(matches!(
            WebhookPayload::parse(b""),
            Err(PayloadError::Empty)
        ));
        assert!(matches!(
            WebhookPayload::parse(b"not json"),
            Err(PayloadError::Invalid(_))
        ));
        assert!(matches!(
            WebhookPayload::parse(br#"{"type":"Issue","data":{}}"#),
            Err(PayloadError::Invalid(_))
        ));
        assert!(matches!(
            WebhookPayload::parse(br#"{"type":"Issue","action":"create"}"#),
            Err(PayloadError::Invalid(_))
        ));
        assert!(matches!(
            WebhookPayload::parse(br#"{"type":"Issue","action":"create","data":null}"#),
            Err(PayloadError::Invalid(_))
        ));
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(EventKind::from_type("Cycle"), EventKind::Cycle);
        assert_eq!(EventKind::from_type("IssueLabel"), EventKind::Label);
        assert_eq!(
            EventKind::from_type("Reaction"),
            EventKind::Other("Reaction".to_string())
        );
    }

    #[test]
    fn test_headers() {
        let headers = WebhookHeaders::from_header_map(|name| match name {
            "linear-delivery" => Some("d-1".to_string()),
            "linear-signature" => Some("abc".to_string()),
            _ => None,
        });

        assert_eq!(headers.delivery_id(), "d-1");
        assert_eq!(headers.signature.as_deref(), Some("abc"));
        assert!(headers.event_type.is_none());
        assert_eq!(WebhookHeaders::default().delivery_id(), "unknown");
    }
}
