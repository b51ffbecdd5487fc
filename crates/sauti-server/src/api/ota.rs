//! OTA boundary endpoints under `/api/ota/`.
//!
//! Devices discover the firmware version and WebSocket endpoint here, and
//! unactivated devices run the activation handshake: the server hands out
//! an activation code plus an HMAC challenge, the device answers with
//! `HMAC(secret, challenge)`, and an activated device receives the bearer
//! token the session transport later validates.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::challenge_hmac;
use crate::devices::DeviceRecord;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ota/", get(ota_info).post(device_check_in))
        .route("/ota/activate", post(activate))
}

/// Firmware version discovery and WebSocket endpoint advertisement.
async fn ota_info(State(state): State<AppState>) -> Json<Value> {
    let ota = &state.config.ota;
    Json(json!({
        "firmware": {
            "version": ota.firmware_version,
            "url": ota.firmware_url,
        },
        "websocket": {
            "url": ota.websocket_url,
        },
    }))
}

/// Per-device check-in. Activated devices receive the endpoint plus a
/// bearer token; unknown or unactivated devices receive an activation
/// challenge instead.
async fn device_check_in(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let serial = header_value(&headers, "device-id").ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "missing Device-Id header")
    })?;
    let client_uuid = header_value(&headers, "client-id");

    let record = match state.devices.get(&serial).await {
        Some(record) => record,
        None => {
            let record = DeviceRecord {
                serial_number: serial.clone(),
                mac: header_value(&headers, "device-mac"),
                client_uuid,
                activation_code: activation_code(),
                challenge: Uuid::new_v4().simple().to_string(),
                activated: false,
            };
            state.devices.upsert(record.clone()).await;
            info!(device = %serial, "new device checked in, activation pending");
            record
        }
    };

    let ota = &state.config.ota;
    let mut body = json!({
        "firmware": {
            "version": ota.firmware_version,
            "url": ota.firmware_url,
        },
        "websocket": {
            "url": ota.websocket_url,
        },
    });

    if record.activated {
        let token = state.verifier.issue(&record.serial_number).map_err(|err| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        })?;
        body["token"] = json!(token);
    } else {
        body["activation"] = json!({
            "code": record.activation_code,
            "challenge": record.challenge,
        });
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    serial_number: String,
    challenge: String,
    hmac: String,
}

/// HMAC-verified activation. On success the device is marked activated and
/// issued its token.
async fn activate(
    State(state): State<AppState>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let record = state
        .devices
        .get(&request.serial_number)
        .await
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "unknown device"))?;

    if record.challenge != request.challenge {
        warn!(device = %request.serial_number, "activation challenge mismatch");
        return Err(error_response(StatusCode::FORBIDDEN, "challenge mismatch"));
    }

    let expected = challenge_hmac(&state.config.auth.secret, &record.challenge)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))?;
    if !expected.eq_ignore_ascii_case(&request.hmac) {
        warn!(device = %request.serial_number, "activation hmac mismatch");
        return Err(error_response(StatusCode::FORBIDDEN, "hmac mismatch"));
    }

    state.devices.mark_activated(&request.serial_number).await;
    let token = state
        .verifier
        .issue(&request.serial_number)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))?;
    info!(device = %request.serial_number, "device activated");
    Ok(Json(json!({ "token": token })))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn activation_code() -> String {
    let mut rng = rand::rng();
    format!("{:06}", rng.random_range(0..1_000_000u32))
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_codes_are_six_digits() {
        for _ in 0..32 {
            let code = activation_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
