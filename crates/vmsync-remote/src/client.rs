//! Authenticated HTTP client shared by both backend generations.

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{RemoteError, Result};

const RESET_HEADER: &str = "x-rate-limit-reset";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Thin wrapper over `reqwest` with bearer-token auth.
///
/// A 401 triggers exactly one token refresh and replay; a transport timeout
/// triggers exactly one replay. 429 responses are surfaced as
/// [`RemoteError::RateLimited`] with the reset instant parsed from the
/// rate-limit header so the pipeline can sleep until then.
pub struct RemoteClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    token: RwLock<Option<String>>,
}

impl RemoteClient {
    pub fn new(base_url: &str, credentials: Credentials, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn refresh_token(&self) -> Result<String> {
        let url = format!("{}/auth/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "client_id": self.credentials.client_id,
                "client_secret": self.credentials.client_secret,
            }))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api {
                status: status.as_u16(),
                body,
            });
        }
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let token: TokenResponse = serde_json::from_str(&response.text().await?)?;
        *self.token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.refresh_token().await
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Issue a request, refreshing the token once on 401 and replaying once
    /// on a transport timeout.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut token = self.bearer().await?;
        let mut refreshed = false;
        let mut retried_timeout = false;

        loop {
            let response = match self.send_once(&method, path, body, &token).await {
                Ok(r) => r,
                Err(e) if e.is_timeout() && !retried_timeout => {
                    retried_timeout = true;
                    tracing::warn!(%path, "remote request timed out, retrying once");
                    tokio::time::sleep(backoff_with_jitter(0, 250, 2_000)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                token = self.refresh_token().await?;
                continue;
            }
            return self.decode(status, response).await;
        }
    }

    async fn decode(&self, status: StatusCode, response: Response) -> Result<serde_json::Value> {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_at = response
                .headers()
                .get(RESET_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_reset);
            return Err(RemoteError::RateLimited { reset_at });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthorized);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            let remote_id = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("existing_id")
                        .and_then(|id| id.as_str())
                        .map(str::to_string)
                });
            return Err(RemoteError::Conflict { remote_id });
        }
        if !status.is_success() {
            return Err(RemoteError::Api {
                status: status.as_u16(),
                body,
            });
        }
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Reset headers arrive either as epoch seconds or RFC 3339.
fn parse_reset(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(epoch) = raw.parse::<i64>() {
        return Utc.timestamp_opt(epoch, 0).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Exponential backoff with jitter for entity-level retries.
pub fn backoff_with_jitter(attempt: u32, base_ms: u64, cap_ms: u64) -> std::time::Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(10)).min(cap_ms);
    let jitter = rand::thread_rng().gen_range(0..=exp / 4 + 1);
    std::time::Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_header_parses_epoch_and_rfc3339() {
        let epoch = parse_reset("1767225600").unwrap();
        assert_eq!(epoch.timestamp(), 1767225600);

        let rfc = parse_reset("2026-08-30T12:00:00Z").unwrap();
        assert_eq!(rfc.to_rfc3339(), "2026-08-30T12:00:00+00:00");

        assert!(parse_reset("soon").is_none());
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let early = backoff_with_jitter(0, 100, 10_000);
        assert!(early.as_millis() >= 100);
        let late = backoff_with_jitter(20, 100, 10_000);
        assert!(late.as_millis() <= 10_000 + 10_000 / 4 + 1);
    }
}
