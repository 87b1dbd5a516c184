//! Mediator: the outbound HTTP delivery of one pointer.
//!
//! Stateless and shared by every group worker. Classifies each attempt into
//! `Success`, `Nack(delay)`, or `ErrorConfig`:
//!
//! - 2xx                      -> Success
//! - 408, 425, 429, 5xx       -> Nack (Retry-After honored, else exponential)
//! - other 4xx                -> ErrorConfig (poison)
//! - connect error / timeout  -> Nack
//!
//! When signing credentials are configured, requests carry
//! `X-FlowCatalyst-Signature` (hex HMAC-SHA256 over `timestamp + body`) and
//! `X-FlowCatalyst-Timestamp` (unix seconds).

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fc_core::{tsid, MediationOutcome, MediationType, MessagePointer};

use crate::credentials::CredentialsCache;

pub const SIGNATURE_HEADER: &str = "X-FlowCatalyst-Signature";
pub const TIMESTAMP_HEADER: &str = "X-FlowCatalyst-Timestamp";
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

type HmacSha256 = Hmac<Sha256>;

/// Per-delivery parameters taken from the pool config at dispatch time, so
/// a pointer keeps its original deadline across config swaps.
#[derive(Debug, Clone)]
pub struct DeliverySpec {
    pub timeout: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    /// Delivery attempt (1 = first); drives the exponential NACK delay.
    pub attempt: u32,
}

/// Outcome of one attempt, plus what the circuit breaker should make of it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub outcome: MediationOutcome,
    pub status_code: Option<u16>,
    /// True when the target (or the path to it) failed; rate limiting and
    /// client misconfiguration do not count against the breaker.
    pub server_fault: bool,
}

impl Delivery {
    fn success(status_code: u16) -> Self {
        Self {
            outcome: MediationOutcome::Success,
            status_code: Some(status_code),
            server_fault: false,
        }
    }

    fn nack(delay_seconds: u32, reason: String, status_code: Option<u16>, server_fault: bool) -> Self {
        Self {
            outcome: MediationOutcome::Nack {
                delay_seconds,
                reason,
            },
            status_code,
            server_fault,
        }
    }

    fn error_config(reason: String, status_code: u16) -> Self {
        Self {
            outcome: MediationOutcome::ErrorConfig { reason },
            status_code: Some(status_code),
            server_fault: false,
        }
    }
}

#[async_trait]
pub trait Mediator: Send + Sync {
    async fn deliver(&self, pointer: &MessagePointer, spec: &DeliverySpec) -> Delivery;
}

/// Wire form of a pointer. Secrets never travel in the delivery body; the
/// router is a pointer broker, the payload lives with the producer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePointer<'a> {
    id: &'a str,
    pool_code: &'a str,
    mediation_type: MediationType,
    mediation_target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_group_id: Option<&'a str>,
}

/// Optional response body the target may use to defer a pointer.
#[derive(Debug, serde::Deserialize)]
struct TargetResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

fn sign(body: &str, secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn backoff_seconds(spec: &DeliverySpec) -> u32 {
    let shift = spec.attempt.saturating_sub(1).min(20);
    let delay_ms = spec
        .retry_min
        .as_millis()
        .saturating_mul(1u128 << shift)
        .min(spec.retry_max.as_millis());
    ((delay_ms / 1000).max(1)) as u32
}

fn retry_after_or_backoff(headers: &reqwest::header::HeaderMap, spec: &DeliverySpec) -> u32 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or_else(|| backoff_seconds(spec))
}

/// Signing configuration: which service account's credentials to present.
pub struct SigningConfig {
    pub credentials: Arc<CredentialsCache>,
    pub service_account_id: String,
}

pub struct HttpMediator {
    client: reqwest::Client,
    signing: Option<SigningConfig>,
}

impl HttpMediator {
    pub fn new(signing: Option<SigningConfig>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(16)
            .build()
            .expect("reqwest client");

        Self { client, signing }
    }

    pub fn with_client(client: reqwest::Client, signing: Option<SigningConfig>) -> Self {
        Self { client, signing }
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn deliver(&self, pointer: &MessagePointer, spec: &DeliverySpec) -> Delivery {
        if pointer.mediation_type != MediationType::HTTP {
            return Delivery::error_config(
                format!("unsupported mediation type: {:?}", pointer.mediation_type),
                0,
            );
        }

        let wire = WirePointer {
            id: &pointer.id,
            pool_code: &pointer.pool_code,
            mediation_type: pointer.mediation_type,
            mediation_target: &pointer.mediation_target,
            message_group_id: pointer.message_group_id.as_deref(),
        };
        let body = match serde_json::to_string(&wire) {
            Ok(b) => b,
            Err(e) => {
                return Delivery::error_config(format!("pointer serialization failed: {e}"), 0)
            }
        };

        let correlation_id = tsid::generate();
        let mut request = self
            .client
            .post(&pointer.mediation_target)
            .timeout(spec.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .header(CORRELATION_HEADER, &correlation_id);

        // Signing secret comes from the control plane; a resolution failure
        // is transient, not a reason to deliver unsigned.
        let mut bearer = pointer.auth_token.as_ref().map(|t| t.expose().to_string());
        if let Some(signing) = self.signing.as_ref() {
            match signing.credentials.get(&signing.service_account_id).await {
                Ok(credentials) => {
                    let timestamp = Utc::now().timestamp();
                    let signature = sign(&body, credentials.signing_secret.expose(), timestamp);
                    request = request
                        .header(SIGNATURE_HEADER, signature)
                        .header(TIMESTAMP_HEADER, timestamp.to_string());
                    if bearer.is_none() && !credentials.auth_token.is_empty() {
                        bearer = Some(credentials.auth_token.expose().to_string());
                    }
                }
                Err(e) => {
                    warn!(
                        pointer_id = %pointer.id,
                        error = %e,
                        "signing credentials unavailable"
                    );
                    return Delivery::nack(
                        backoff_seconds(spec),
                        "signing credentials unavailable".to_string(),
                        None,
                        false,
                    );
                }
            }
        }

        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        debug!(
            pointer_id = %pointer.id,
            target = %pointer.mediation_target,
            correlation_id = %correlation_id,
            attempt = spec.attempt,
            "delivering pointer"
        );

        match request.body(body).send().await {
            Ok(response) => {
                let status = response.status();
                let status_code = status.as_u16();

                if status.is_success() {
                    // The target may defer explicitly through the body.
                    if let Ok(text) = response.text().await {
                        if let Ok(parsed) = serde_json::from_str::<TargetResponse>(&text) {
                            if !parsed.ack {
                                let delay = parsed.delay_seconds.unwrap_or(5);
                                debug!(
                                    pointer_id = %pointer.id,
                                    delay_seconds = delay,
                                    "target deferred the pointer"
                                );
                                return Delivery::nack(
                                    delay,
                                    "target returned ack=false".to_string(),
                                    Some(status_code),
                                    false,
                                );
                            }
                        }
                    }

                    info!(
                        pointer_id = %pointer.id,
                        status_code,
                        "pointer delivered"
                    );
                    Delivery::success(status_code)
                } else if status_code == 429 || status_code == 425 {
                    // Target-side rate limiting: back off, not a fault.
                    let delay = retry_after_or_backoff(response.headers(), spec);
                    warn!(
                        pointer_id = %pointer.id,
                        status_code,
                        delay_seconds = delay,
                        "target throttled delivery"
                    );
                    Delivery::nack(
                        delay,
                        format!("HTTP {status_code}"),
                        Some(status_code),
                        false,
                    )
                } else if status_code == 408 || status.is_server_error() {
                    let delay = retry_after_or_backoff(response.headers(), spec);
                    warn!(
                        pointer_id = %pointer.id,
                        status_code,
                        delay_seconds = delay,
                        "transient target failure"
                    );
                    Delivery::nack(
                        delay,
                        format!("HTTP {status_code}"),
                        Some(status_code),
                        true,
                    )
                } else {
                    // Remaining 4xx: the target will never accept this
                    // pointer as configured.
                    warn!(
                        pointer_id = %pointer.id,
                        status_code,
                        target = %pointer.mediation_target,
                        "configuration error from target"
                    );
                    Delivery::error_config(format!("HTTP {status_code}"), status_code)
                }
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "delivery timeout".to_string()
                } else if e.is_connect() {
                    format!("connection error: {e}")
                } else {
                    format!("request failed: {e}")
                };
                warn!(pointer_id = %pointer.id, error = %reason, "delivery failed");
                Delivery::nack(backoff_seconds(spec), reason, None, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(attempt: u32) -> DeliverySpec {
        DeliverySpec {
            timeout: Duration::from_secs(30),
            retry_min: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
            attempt,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff_seconds(&spec(1)), 1);
        assert_eq!(backoff_seconds(&spec(2)), 2);
        assert_eq!(backoff_seconds(&spec(3)), 4);
        assert_eq!(backoff_seconds(&spec(5)), 16);
        assert_eq!(backoff_seconds(&spec(12)), 300);
        assert_eq!(backoff_seconds(&spec(200)), 300);
    }

    #[test]
    fn signature_is_stable_hex() {
        let a = sign(r#"{"id":"p1"}"#, "secret", 1_700_000_000);
        let b = sign(r#"{"id":"p1"}"#, "secret", 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // Timestamp participates in the signed payload.
        let c = sign(r#"{"id":"p1"}"#, "secret", 1_700_000_001);
        assert_ne!(a, c);
    }

    #[test]
    fn wire_pointer_has_no_secrets() {
        let wire = WirePointer {
            id: "p1",
            pool_code: "ORDERS",
            mediation_type: MediationType::HTTP,
            mediation_target: "https://example.com/hook",
            message_group_id: Some("g1"),
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert!(!json.contains("authToken"));
        assert!(!json.contains("token"));
        assert!(json.contains(r#""poolCode":"ORDERS""#));
    }
}
