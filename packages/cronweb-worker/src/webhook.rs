//! Out-of-process HTTP webhook dispatch: an HMAC-SHA256-signed POST describing
//! one shot's outcome. Always available, unlike compile-time local hooks.

use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub name: String,
    pub shot_id: String,
    pub state: String,
    pub job_type: String,
    pub timestamp: i64,
}

/// Configuration for the single configured webhook endpoint. `None` disables
/// dispatch entirely.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

fn sign(secret: &str, payload_bytes: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload_bytes);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Posts `payload` to `config.url`, signed with `config.secret`. Failures of
/// any kind (network, non-2xx, timeout) are logged and swallowed: a webhook
/// can never affect shot state or retry decisions.
pub async fn dispatch(config: &WebhookConfig, payload: &WebhookPayload) {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize webhook payload");
            return;
        }
    };
    let token = sign(&config.secret, &body);

    let client = match reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build webhook client");
            return;
        }
    };

    let result = client
        .post(&config.url)
        .header("Content-Type", "application/json; charset=UTF-8")
        .header("X-Cronweb-Token", token)
        .header("X-Cronweb-Timestamp", payload.timestamp.to_string())
        .header("User-Agent", "CronWeb/Webhook")
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) if !resp.status().is_success() => {
            tracing::warn!(status = %resp.status(), url = %config.url, "webhook returned non-success status");
        }
        Err(e) => {
            tracing::warn!(error = %e, url = %config.url, "webhook dispatch failed");
        }
        Ok(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_base64() {
        let sig1 = sign("secret", b"{\"a\":1}");
        let sig2 = sign("secret", b"{\"a\":1}");
        assert_eq!(sig1, sig2);
        assert!(base64::engine::general_purpose::STANDARD.decode(&sig1).is_ok());
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        assert_ne!(sign("secret-a", b"payload"), sign("secret-b", b"payload"));
    }
}
