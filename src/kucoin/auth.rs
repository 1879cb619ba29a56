//! Request signing for the KuCoin REST API
//!
//! Private endpoints carry `KC-API-SIGN`, the base64 HMAC-SHA256 of
//! `timestamp + method + endpoint + body` keyed by the API secret. With key
//! version 2 the passphrase is signed the same way.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::ExchangeConfig;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_VERSION: &str = "2";

/// Base64 HMAC-SHA256 of `payload` keyed by `secret`
pub fn sign(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// String signed for a request: `{timestamp}{METHOD}{endpoint}{body}`
pub fn prehash(timestamp_ms: i64, method: &str, endpoint: &str, body: &str) -> String {
    format!("{}{}{}{}", timestamp_ms, method.to_uppercase(), endpoint, body)
}

/// API credentials container
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
    api_passphrase: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        api_passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            api_passphrase: api_passphrase.into(),
        }
    }

    /// Credentials from the exchange section, if all three parts are set
    pub fn from_config(config: &ExchangeConfig) -> Option<Self> {
        match (&config.api_key, &config.api_secret, &config.api_passphrase) {
            (Some(key), Some(secret), Some(passphrase))
                if !key.is_empty() && !secret.is_empty() && !passphrase.is_empty() =>
            {
                Some(Self::new(key, secret, passphrase))
            }
            _ => None,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Authentication headers for one request
    pub fn headers(
        &self,
        timestamp_ms: i64,
        method: &str,
        endpoint: &str,
        body: &str,
    ) -> Vec<(&'static str, String)> {
        let signature = sign(&prehash(timestamp_ms, method, endpoint, body), &self.api_secret);
        vec![
            ("KC-API-KEY", self.api_key.clone()),
            ("KC-API-SIGN", signature),
            ("KC-API-TIMESTAMP", timestamp_ms.to_string()),
            ("KC-API-PASSPHRASE", sign(&self.api_passphrase, &self.api_secret)),
            ("KC-API-KEY-VERSION", KEY_VERSION.to_string()),
        ]
    }
}
