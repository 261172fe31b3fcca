use crate::models::ApiError;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::{collections::HashMap, convert::Infallible, env};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

const MAX_BODY_BYTES: usize = 1 << 20;

/// Webhook signature verification. The platform signs every POST body with
/// the app secret; `X-Hub-Signature: sha1=<hex>`.
#[derive(Clone)]
pub struct SignatureState {
    app_secret: Option<String>,
}

impl SignatureState {
    pub fn from_env() -> Self {
        let app_secret = env::var("APP_SECRET").ok().filter(|s| !s.is_empty());
        if app_secret.is_none() {
            warn!(
                target = "boutique.api",
                "APP_SECRET unset; webhook signatures will not be verified"
            );
        }
        Self { app_secret }
    }

    #[cfg(test)]
    fn with_secret(secret: &str) -> Self {
        Self {
            app_secret: Some(secret.to_string()),
        }
    }
}

pub async fn verify_signature(
    State(state): State<SignatureState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(secret) = &state.app_secret else {
        return Ok(next.run(request).await);
    };

    let (parts, body) = request.into_parts();
    let presented = parts
        .headers
        .get("X-Hub-Signature")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let Some(presented) = presented else {
        return Ok(forbidden("missing_signature", "X-Hub-Signature required"));
    };

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Ok(bad_request("unreadable_body", "Body too large or truncated"));
        }
    };

    if !signature_matches(secret, &bytes, &presented) {
        warn!(target = "boutique.api", "webhook signature mismatch");
        return Ok(forbidden("invalid_signature", "Signature verification failed"));
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// Constant-time comparison of `sha1=<hex>` against the body HMAC.
fn signature_matches(secret: &str, body: &Bytes, presented: &str) -> bool {
    let Some(hex_digest) = presented.strip_prefix("sha1=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn forbidden(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::FORBIDDEN, Json(payload)).into_response()
}

fn bad_request(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::BAD_REQUEST, Json(payload)).into_response()
}

/// Per-sender ingress throttle. A flooding sender gets their excess events
/// dropped; the webhook still acks so the platform does not retry. The first
/// drop in a throttled stretch asks the sender to slow down, the rest are
/// silent.
pub struct SenderLimiter {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// `notify` is set on the first rejection of a throttled stretch.
    Throttled { notify: bool },
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    warned: bool,
}

impl SenderLimiter {
    pub fn from_env() -> Self {
        let rate_per_sec = env::var("SENDER_RATE_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(1.0);
        let capacity = env::var("SENDER_BURST")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(5.0);
        Self::new(rate_per_sec, capacity)
    }

    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn admit(&self, sender: &str) -> Admission {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let state = buckets
            .entry(sender.to_string())
            .or_insert_with(|| BucketState {
                tokens: self.capacity,
                last_refill: now,
                warned: false,
            });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.warned = false;
            Admission::Allowed
        } else {
            debug!(target = "boutique.api", sender, "sender over rate limit, event dropped");
            let notify = !state.warned;
            state.warned = true;
            Admission::Throttled { notify }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, advance};

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = Bytes::from_static(b"{\"object\":\"page\"}");
        let header = sign("app-secret", &body);
        assert!(signature_matches("app-secret", &body, &header));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign("app-secret", b"{\"object\":\"page\"}");
        let tampered = Bytes::from_static(b"{\"object\":\"hacked\"}");
        assert!(!signature_matches("app-secret", &tampered, &header));
    }

    #[test]
    fn wrong_scheme_or_garbage_hex_is_rejected() {
        let body = Bytes::from_static(b"x");
        assert!(!signature_matches("s", &body, "sha256=abcdef"));
        assert!(!signature_matches("s", &body, "sha1=not-hex"));
        assert!(!signature_matches("s", &body, ""));
    }

    #[test]
    fn unset_secret_state_skips_verification() {
        // Covered structurally: verify_signature passes through when the
        // secret is absent; from_env without APP_SECRET builds that state.
        let state = SignatureState {
            app_secret: None,
        };
        assert!(state.app_secret.is_none());
        let configured = SignatureState::with_secret("s");
        assert!(configured.app_secret.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_capacity_then_throttled_with_single_notice() {
        let limiter = SenderLimiter::new(1.0, 3.0);
        assert_eq!(limiter.admit("u1").await, Admission::Allowed);
        assert_eq!(limiter.admit("u1").await, Admission::Allowed);
        assert_eq!(limiter.admit("u1").await, Admission::Allowed);
        // First rejection carries the notice, later ones stay silent.
        assert_eq!(
            limiter.admit("u1").await,
            Admission::Throttled { notify: true }
        );
        assert_eq!(
            limiter.admit("u1").await,
            Admission::Throttled { notify: false }
        );
        // Another sender has their own bucket.
        assert_eq!(limiter.admit("u2").await, Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time() {
        let limiter = SenderLimiter::new(1.0, 2.0);
        assert_eq!(limiter.admit("u1").await, Admission::Allowed);
        assert_eq!(limiter.admit("u1").await, Admission::Allowed);
        assert_eq!(
            limiter.admit("u1").await,
            Admission::Throttled { notify: true }
        );

        advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.admit("u1").await, Admission::Allowed);
        assert_eq!(limiter.admit("u1").await, Admission::Allowed);
        // The refill resets the notice flag too.
        assert_eq!(
            limiter.admit("u1").await,
            Admission::Throttled { notify: true }
        );
    }
}
