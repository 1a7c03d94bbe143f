//! Inbound request authentication.
//!
//! Every management request carries a unix timestamp and an HMAC-SHA256
//! signature over `"{timestamp}.{hex(sha256(body))}"` keyed with the shared
//! agent secret. Requests outside the replay window are rejected regardless
//! of signature validity.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use http::StatusCode;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-stevedore-timestamp";
pub const SIGNATURE_HEADER: &str = "x-stevedore-signature";

/// Largest request body the agent accepts.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub replay_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingHeaders,
    MalformedSignature,
    OutsideReplayWindow,
    BadSignature,
}

impl AuthRejection {
    fn message(self) -> &'static str {
        match self {
            Self::MissingHeaders => "Missing authentication headers",
            Self::MalformedSignature => "Malformed signature",
            Self::OutsideReplayWindow => "Request timestamp outside replay window",
            Self::BadSignature => "Invalid signature",
        }
    }
}

fn signed_message(timestamp: u64, body: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(body));
    format!("{timestamp}.{digest}")
}

/// Compute the signature a client must attach for `timestamp` and `body`.
pub fn compute_signature(secret: &str, timestamp: u64, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signed_message(timestamp, body).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_signature(
    auth: &AuthConfig,
    timestamp: u64,
    now: u64,
    body: &[u8],
    signature_hex: &str,
) -> Result<(), AuthRejection> {
    if now.abs_diff(timestamp) > auth.replay_window.as_secs() {
        return Err(AuthRejection::OutsideReplayWindow);
    }

    let signature = hex::decode(signature_hex).map_err(|_| AuthRejection::MalformedSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(auth.secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signed_message(timestamp, body).as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthRejection::BadSignature)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub async fn require_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let (parts, body) = request.into_parts();

    let timestamp = parts
        .headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            AuthRejection::MissingHeaders.message().to_string(),
        ));
    };

    let bytes: bytes::Bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| (StatusCode::PAYLOAD_TOO_LARGE, "Body too large".to_string()))?;

    if let Err(rejection) =
        verify_signature(&state.auth, timestamp, unix_now(), &bytes, &signature)
    {
        log::warn!(
            "Rejected {} {}: {}",
            parts.method,
            parts.uri.path(),
            rejection.message()
        );
        return Err((StatusCode::UNAUTHORIZED, rejection.message().to_string()));
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthConfig {
        AuthConfig {
            secret: "test-secret".to_string(),
            replay_window: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_signature_roundtrip() {
        let auth = auth();
        let body = br#"{"image":"nginx"}"#;
        let signature = compute_signature(&auth.secret, 1_000_000, body);
        assert!(verify_signature(&auth, 1_000_000, 1_000_120, body, &signature).is_ok());
    }

    #[test]
    fn test_empty_body_roundtrip() {
        let auth = auth();
        let signature = compute_signature(&auth.secret, 42, b"");
        assert!(verify_signature(&auth, 42, 42, b"", &signature).is_ok());
    }

    #[test]
    fn test_replay_window_rejects_old_and_future_timestamps() {
        let auth = auth();
        let signature = compute_signature(&auth.secret, 1_000_000, b"");
        assert_eq!(
            verify_signature(&auth, 1_000_000, 1_000_301, b"", &signature),
            Err(AuthRejection::OutsideReplayWindow)
        );
        assert_eq!(
            verify_signature(&auth, 1_000_602, 1_000_000, b"", &signature),
            Err(AuthRejection::OutsideReplayWindow)
        );
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let auth = auth();
        let signature = compute_signature(&auth.secret, 1_000_000, br#"{"image":"nginx"}"#);
        assert_eq!(
            verify_signature(&auth, 1_000_000, 1_000_000, br#"{"image":"evil"}"#, &signature),
            Err(AuthRejection::BadSignature)
        );
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let auth = auth();
        let signature = compute_signature("other-secret", 1_000_000, b"");
        assert_eq!(
            verify_signature(&auth, 1_000_000, 1_000_000, b"", &signature),
            Err(AuthRejection::BadSignature)
        );
    }

    #[test]
    fn test_malformed_signature_is_rejected() {
        let auth = auth();
        assert_eq!(
            verify_signature(&auth, 1_000_000, 1_000_000, b"", "not-hex"),
            Err(AuthRejection::MalformedSignature)
        );
    }
}
