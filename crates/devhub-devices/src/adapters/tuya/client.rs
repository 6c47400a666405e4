//! Signed HTTP client for the Tuya OpenAPI.
//!
//! Every request carries `client_id`, `access_token`, `t`, `sign_method`,
//! `nonce` and `sign` headers. The signature covers
//! `client_id + access_token + t + nonce + stringToSign` where
//!
//! ```text
//! stringToSign = METHOD \n hex(sha256(body)) \n <empty headers line> \n path?query
//! ```
//!
//! Token calls are signed with an empty access token.

use crate::adapter::{AdapterConfig, AdapterError, AdapterResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Tokens are refreshed once they expire within this window.
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 5 * 60;

/// Vendor error codes meaning the access token is invalid or expired.
const TOKEN_INVALID_CODES: [i64; 2] = [1010, 1011];

/// Build the canonical string that is signed for a request.
pub fn string_to_sign(method: &str, body: &[u8], url: &str) -> String {
    let content_hash = hex::encode(Sha256::digest(body));
    format!("{}\n{}\n\n{}", method.to_ascii_uppercase(), content_hash, url)
}

/// Compute the request signature, upper-case hex.
pub fn sign(
    client_secret: &str,
    client_id: &str,
    access_token: &str,
    timestamp: &str,
    nonce: &str,
    string_to_sign: &str,
) -> AdapterResult<String> {
    let mut mac = HmacSha256::new_from_slice(client_secret.as_bytes())
        .map_err(|e| AdapterError::Configuration(format!("invalid client secret: {}", e)))?;
    mac.update(client_id.as_bytes());
    mac.update(access_token.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(nonce.as_bytes());
    mac.update(string_to_sign.as_bytes());
    Ok(hex::encode_upper(mac.finalize().into_bytes()))
}

/// Access/refresh token pair with its expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub uid: Option<String>,
}

impl TokenState {
    /// True when the token expires within the refresh buffer.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= ChronoDuration::seconds(TOKEN_REFRESH_BUFFER_SECS)
    }
}

/// Expiry instant for a token granted at `now` with a vendor lifetime.
fn token_expiry(now: DateTime<Utc>, expire_time: i64) -> AdapterResult<DateTime<Utc>> {
    ChronoDuration::try_seconds(expire_time)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            AdapterError::Authentication(format!(
                "malformed token response: expire_time {} out of range",
                expire_time
            ))
        })
}

#[derive(Debug, Deserialize)]
struct TokenResult {
    access_token: String,
    refresh_token: String,
    /// Lifetime in seconds
    expire_time: i64,
    #[serde(default)]
    uid: Option<String>,
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub t: Option<i64>,
}

/// Whether an API failure should surface as a rejected command or a read failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Read,
    Command,
}

pub struct TuyaClient {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    uid: Option<String>,
    initial_refresh_token: Option<String>,
    token: Mutex<Option<TokenState>>,
}

impl TuyaClient {
    pub fn new(config: &AdapterConfig, base_url: impl Into<String>) -> AdapterResult<Self> {
        let http = Client::builder()
            .connect_timeout(config.connection_timeout())
            .timeout(config.command_timeout())
            .build()
            .map_err(|e| AdapterError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: config.auth_str("client_id")?.to_string(),
            client_secret: config.auth_str("client_secret")?.to_string(),
            uid: config.auth_opt("uid").map(str::to_string),
            initial_refresh_token: config.auth_opt("refresh_token").map(str::to_string),
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current token, if one has been acquired.
    pub async fn token(&self) -> Option<TokenState> {
        self.token.lock().await.clone()
    }

    pub async fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.token.lock().await.as_ref().map(|t| t.expires_at)
    }

    /// Drop the cached token so the next call acquires a new one.
    pub async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// User id whose devices are listed.
    pub async fn uid(&self) -> AdapterResult<String> {
        if let Some(uid) = &self.uid {
            return Ok(uid.clone());
        }
        let token = self.ensure_token().await?;
        token.uid.ok_or_else(|| {
            AdapterError::Configuration(
                "tuya adapter requires auth.uid (not returned by token grant)".to_string(),
            )
        })
    }

    /// Return a token valid beyond the refresh buffer, refreshing if needed.
    ///
    /// The token lock is held across the exchange so concurrent callers wait
    /// for a single refresh.
    pub async fn ensure_token(&self) -> AdapterResult<TokenState> {
        let mut guard = self.token.lock().await;
        let now = Utc::now();

        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh(now) {
                return Ok(token.clone());
            }
        }

        let refresh_token = guard
            .as_ref()
            .map(|t| t.refresh_token.clone())
            .or_else(|| self.initial_refresh_token.clone());

        let path = match &refresh_token {
            Some(rt) => format!("/v1.0/token/{}", rt),
            None => "/v1.0/token?grant_type=1".to_string(),
        };

        tracing::debug!(
            refreshing = refresh_token.is_some(),
            "requesting tuya access token"
        );

        let result = match self.signed_request(Method::GET, &path, None, "").await {
            Ok(envelope) if envelope.success => envelope.result,
            Ok(envelope) => {
                *guard = None;
                return Err(AdapterError::Authentication(format!(
                    "token exchange rejected: {} (code {})",
                    envelope.msg.unwrap_or_default(),
                    envelope.code.unwrap_or_default()
                )));
            }
            Err(e) => {
                *guard = None;
                return Err(AdapterError::Authentication(format!(
                    "token exchange failed: {}",
                    e
                )));
            }
        };

        let parsed: TokenResult = serde_json::from_value(result).map_err(|e| {
            AdapterError::Authentication(format!("malformed token response: {}", e))
        })?;

        let token = TokenState {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: token_expiry(now, parsed.expire_time)?,
            uid: parsed.uid,
        };
        tracing::info!(expires_at = %token.expires_at, "tuya access token acquired");
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Authenticated request returning the envelope's `result`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        kind: CallKind,
    ) -> AdapterResult<Value> {
        let token = self.ensure_token().await?;
        let envelope = self
            .signed_request(method, path, body, &token.access_token)
            .await?;

        if envelope.success {
            return Ok(envelope.result);
        }

        let code = envelope.code.unwrap_or_default();
        let msg = envelope.msg.unwrap_or_else(|| "unknown error".to_string());
        if TOKEN_INVALID_CODES.contains(&code) {
            self.invalidate_token().await;
            return Err(AdapterError::Authentication(format!("{} (code {})", msg, code)));
        }
        Err(match kind {
            CallKind::Command => AdapterError::CommandRejected(format!("{} (code {})", msg, code)),
            CallKind::Read => AdapterError::Communication(format!("{} (code {})", msg, code)),
        })
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: &str,
    ) -> AdapterResult<Envelope> {
        let body_bytes = match body {
            Some(v) => serde_json::to_vec(v)
                .map_err(|e| AdapterError::Validation(format!("unencodable body: {}", e)))?,
            None => Vec::new(),
        };
        let timestamp = Utc::now().timestamp_millis().to_string();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let to_sign = string_to_sign(method.as_str(), &body_bytes, path);
        let signature = sign(
            &self.client_secret,
            &self.client_id,
            access_token,
            &timestamp,
            &nonce,
            &to_sign,
        )?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("client_id", &self.client_id)
            .header("t", &timestamp)
            .header("sign_method", "HMAC-SHA256")
            .header("nonce", &nonce)
            .header("sign", &signature);
        if !access_token.is_empty() {
            req = req.header("access_token", access_token);
        }
        if !body_bytes.is_empty() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_bytes);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Communication(format!("request to {} timed out", path))
            } else if e.is_connect() {
                AdapterError::Connection(e.to_string())
            } else {
                AdapterError::Communication(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::Communication(format!(
                "HTTP {} from {}",
                status, path
            )));
        }

        resp.json::<Envelope>()
            .await
            .map_err(|e| AdapterError::Communication(format!("invalid response body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_sign_layout() {
        let s = string_to_sign("get", b"", "/v1.0/token?grant_type=1");
        assert_eq!(
            s,
            "GET\ne3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\n/v1.0/token?grant_type=1"
        );
    }

    #[test]
    fn test_sign_is_upper_hex_and_order_sensitive() {
        let to_sign = string_to_sign("POST", br#"{"commands":[]}"#, "/v1.0/devices/abc/commands");
        let a = sign("secret", "cid", "tok", "1700000000000", "n1", &to_sign).unwrap();
        let b = sign("secret", "cid", "", "1700000000000", "n1", &to_sign).unwrap();

        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_ne!(a, b);

        // Same bytes, same concatenation: moving text between fields is invisible.
        let c = sign("secret", "cidtok", "", "1700000000000", "n1", &to_sign).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_sign_matches_manual_hmac() {
        let to_sign = string_to_sign("GET", b"", "/v1.0/devices/bf0123456789");
        let mut mac = HmacSha256::new_from_slice(b"k").unwrap();
        mac.update(format!("idat17n{}", to_sign).as_bytes());
        let expected = hex::encode_upper(mac.finalize().into_bytes());

        assert_eq!(sign("k", "id", "at", "17", "n", &to_sign).unwrap(), expected);
    }

    #[test]
    fn test_token_refresh_buffer() {
        let now = Utc::now();
        let token = |secs: i64| TokenState {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: now + ChronoDuration::seconds(secs),
            uid: None,
        };

        assert!(token(60).needs_refresh(now));
        assert!(token(300).needs_refresh(now));
        assert!(!token(301).needs_refresh(now));
        assert!(!token(7200).needs_refresh(now));
    }

    #[test]
    fn test_token_expiry_rejects_out_of_range_lifetime() {
        let now = Utc::now();
        assert_eq!(
            token_expiry(now, 7200).unwrap(),
            now + ChronoDuration::seconds(7200)
        );
        for bad in [i64::MAX, i64::MIN, 1_000_000_000_000_000] {
            assert!(matches!(
                token_expiry(now, bad),
                Err(AdapterError::Authentication(msg)) if msg.contains("malformed token response")
            ));
        }
    }
}
