//! Bearer-token verification for the session transport.
//!
//! Tokens are issued by the OTA activation flow and validated here with an
//! HMAC-SHA256 signature over `device_id|expiry`. The default policy is
//! permissive: failures are logged and the connection is admitted with the
//! device id taken from the `Device-Id` header. `auth.strict` rejects
//! instead.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use sauti_core::config::AuthConfig;
use sauti_core::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub struct TokenVerifier {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            secret: config.secret.as_bytes().to_vec(),
            ttl: Duration::from_secs(config.token_ttl_secs),
        }
    }

    /// Issue a signed token binding `device_id` until the configured TTL.
    pub fn issue(&self, device_id: &str) -> Result<String> {
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Internal(format!("clock error: {e}")))?
            .as_secs()
            + self.ttl.as_secs();
        let payload = format!("{device_id}|{expires}");
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            self.sign(&payload)?
        ))
    }

    /// Validate signature and expiry, returning the embedded device id.
    pub fn verify(&self, token: &str) -> Result<String> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or_else(|| Error::Auth("malformed token".to_string()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| Error::Auth("malformed token payload".to_string()))?;
        let payload = String::from_utf8(payload)
            .map_err(|_| Error::Auth("malformed token payload".to_string()))?;

        let signature = hex::decode(signature)
            .map_err(|_| Error::Auth("malformed token signature".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("hmac init: {e}")))?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::Auth("invalid token signature".to_string()))?;

        let (device_id, expires) = payload
            .split_once('|')
            .ok_or_else(|| Error::Auth("malformed token payload".to_string()))?;
        let expires: u64 = expires
            .parse()
            .map_err(|_| Error::Auth("malformed token expiry".to_string()))?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Internal(format!("clock error: {e}")))?
            .as_secs();
        if now >= expires {
            return Err(Error::Auth("token expired".to_string()));
        }
        Ok(device_id.to_string())
    }

    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("hmac init: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// HMAC over an activation challenge, shared with the OTA flow.
pub fn challenge_hmac(secret: &str, challenge: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Internal(format!("hmac init: {e}")))?;
    mac.update(challenge.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Outcome of upgrade-time authentication.
#[derive(Debug)]
pub enum AuthDecision {
    /// Connection proceeds with this (possibly absent) device id.
    Admit { device_id: Option<String> },
    /// Strict mode only: close the upgrade with an error.
    Reject { reason: String },
}

/// Apply the repository's permissive policy to the upgrade request.
pub fn authenticate(config: &AuthConfig, verifier: &TokenVerifier, headers: &HeaderMap) -> AuthDecision {
    let header_device_id = headers
        .get("device-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if !config.enabled {
        return AuthDecision::Admit {
            device_id: header_device_id,
        };
    }

    let Some(auth_header) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        debug!("missing Authorization header, admitting connection");
        return AuthDecision::Admit {
            device_id: header_device_id,
        };
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        warn!("malformed Authorization header");
        return permissive_or_reject(config, header_device_id, "malformed authorization header");
    };

    match verifier.verify(token) {
        Ok(device_id) => {
            if let Some(requested) = header_device_id.as_deref() {
                if requested != device_id {
                    warn!(
                        token_device = %device_id,
                        request_device = %requested,
                        "device id mismatch between token and header"
                    );
                    return permissive_or_reject(config, Some(device_id), "device id mismatch");
                }
            }
            debug!(device_id = %device_id, "token verified");
            AuthDecision::Admit {
                device_id: Some(device_id),
            }
        }
        Err(err) => {
            warn!("token verification failed, policy decides admission: {err}");
            permissive_or_reject(config, header_device_id, "invalid token")
        }
    }
}

fn permissive_or_reject(
    config: &AuthConfig,
    device_id: Option<String>,
    reason: &str,
) -> AuthDecision {
    if config.strict {
        AuthDecision::Reject {
            reason: reason.to_string(),
        }
    } else {
        AuthDecision::Admit { device_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_config(enabled: bool, strict: bool) -> AuthConfig {
        AuthConfig {
            enabled,
            strict,
            secret: "unit-test-secret".to_string(),
            token_ttl_secs: 3600,
        }
    }

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).expect("header name"),
                value.parse().expect("header value"),
            );
        }
        headers
    }

    #[test]
    fn issued_token_verifies_to_device_id() {
        let verifier = TokenVerifier::new(&auth_config(true, false));
        let token = verifier.issue("esp32-01").expect("issue");
        assert_eq!(verifier.verify(&token).expect("verify"), "esp32-01");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let verifier = TokenVerifier::new(&auth_config(true, false));
        let token = verifier.issue("esp32-01").expect("issue");
        let mut tampered = token.clone();
        tampered.truncate(token.len() - 2);
        tampered.push_str("ff");
        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let issuing = TokenVerifier::new(&auth_config(true, false));
        let token = issuing.issue("esp32-01").expect("issue");
        let mut other = auth_config(true, false);
        other.secret = "another-secret".to_string();
        assert!(TokenVerifier::new(&other).verify(&token).is_err());
    }

    #[test]
    fn permissive_mode_admits_invalid_tokens() {
        let config = auth_config(true, false);
        let verifier = TokenVerifier::new(&config);
        let headers = headers_with(&[
            ("authorization", "Bearer not.a.token"),
            ("device-id", "esp32-01"),
        ]);
        match authenticate(&config, &verifier, &headers) {
            AuthDecision::Admit { device_id } => assert_eq!(device_id.as_deref(), Some("esp32-01")),
            AuthDecision::Reject { .. } => panic!("permissive mode must admit"),
        }
    }

    #[test]
    fn strict_mode_rejects_invalid_tokens() {
        let config = auth_config(true, true);
        let verifier = TokenVerifier::new(&config);
        let headers = headers_with(&[("authorization", "Bearer not.a.token")]);
        assert!(matches!(
            authenticate(&config, &verifier, &headers),
            AuthDecision::Reject { .. }
        ));
    }

    #[test]
    fn device_id_comes_from_token_when_valid() {
        let config = auth_config(true, false);
        let verifier = TokenVerifier::new(&config);
        let token = verifier.issue("esp32-02").expect("issue");
        let headers = headers_with(&[
            ("authorization", &format!("Bearer {token}") as &str),
            ("device-id", "esp32-02"),
        ]);
        match authenticate(&config, &verifier, &headers) {
            AuthDecision::Admit { device_id } => assert_eq!(device_id.as_deref(), Some("esp32-02")),
            AuthDecision::Reject { .. } => panic!("valid token must admit"),
        }
    }

    #[test]
    fn challenge_hmac_is_deterministic_per_secret() {
        let ours = challenge_hmac("activation-secret", "ch-42").expect("hmac");
        let device = challenge_hmac("activation-secret", "ch-42").expect("hmac");
        assert_eq!(ours, device);
        let wrong = challenge_hmac("other-secret", "ch-42").expect("hmac");
        assert_ne!(ours, wrong);
    }

    #[test]
    fn disabled_auth_uses_header_device_id() {
        let config = auth_config(false, false);
        let verifier = TokenVerifier::new(&config);
        let headers = headers_with(&[("device-id", "bare-device")]);
        match authenticate(&config, &verifier, &headers) {
            AuthDecision::Admit { device_id } => {
                assert_eq!(device_id.as_deref(), Some("bare-device"))
            }
            AuthDecision::Reject { .. } => panic!("disabled auth always admits"),
        }
    }
}
