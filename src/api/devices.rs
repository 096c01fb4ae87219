// Device registration.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::{self, EventRefs};
use crate::db::schema;
use crate::error::Result;

use super::ApiState;

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub public_key_pem: String,
    pub device_info: Option<String>,
    pub crypto_version: Option<String>,
}

/// Register a device and its public key. Re-registering with a different
/// crypto tag is an upgrade: the stored key is overwritten and audited.
/// Identical re-registration succeeds idempotently.
pub async fn register_device(
    State(state): State<ApiState>,
    Json(body): Json<RegisterDeviceRequest>,
) -> Result<Json<Value>> {
    let crypto_version = body.crypto_version.unwrap_or_else(|| "hmac".to_string());

    if crate::crypto::is_mvp_key(&body.public_key_pem) {
        log::info!("Registering device with MVP key format: {}", body.device_id);
    } else {
        use p256::pkcs8::DecodePublicKey;
        let normalized = crate::crypto::normalize_pem(&body.public_key_pem);
        match p256::ecdsa::VerifyingKey::from_public_key_pem(&normalized) {
            Ok(_) => {
                log::info!("Registering device with ECDSA key format: {}", body.device_id)
            }
            // Registration is permissive: an unparseable key is recorded
            // anyway and will simply fail verification at upload time.
            Err(e) => log::warn!("Key validation warning for {}: {}", body.device_id, e),
        }
    }

    let response = state
        .db
        .call(move |conn| {
            if let Some(existing) = schema::get_device(conn, &body.device_id)? {
                if existing.crypto_version != crypto_version {
                    schema::update_device_crypto(
                        conn,
                        &body.device_id,
                        &body.public_key_pem,
                        &crypto_version,
                    )?;
                    log::info!("Device {} upgraded crypto to {}", body.device_id, crypto_version);
                    audit::log_event(
                        conn,
                        "device_register",
                        json!({
                            "device_id": body.device_id,
                            "action": "crypto_upgrade",
                            "crypto_version": crypto_version,
                        }),
                        EventRefs {
                            device_id: Some(&body.device_id),
                            ..Default::default()
                        },
                    )?;
                    return Ok(json!({
                        "status": "success",
                        "device_id": body.device_id,
                        "message": format!("Device crypto upgraded to {}", crypto_version),
                    }));
                }

                log::info!("Device already registered: {}", body.device_id);
                return Ok(json!({
                    "status": "success",
                    "device_id": body.device_id,
                    "message": "Device already registered",
                }));
            }

            schema::insert_device(
                conn,
                &body.device_id,
                &body.public_key_pem,
                body.device_info.as_deref(),
                &crypto_version,
            )?;
            audit::log_event(
                conn,
                "device_register",
                json!({ "device_id": body.device_id, "crypto_version": crypto_version }),
                EventRefs {
                    device_id: Some(&body.device_id),
                    ..Default::default()
                },
            )?;
            log::info!("Registered new device: {}", body.device_id);

            Ok(json!({
                "status": "success",
                "device_id": body.device_id,
                "message": "Device registered successfully",
            }))
        })
        .await?;

    Ok(Json(response))
}
