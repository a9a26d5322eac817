//! Artifact fetcher: bounded, retrying GETs against the repository host
//! with exponential backoff.
//!
//! The HTTP client is created once at construction and owned by the
//! engine rather than living behind global mutable state.

use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::error::OtaError;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::thread::sleep;
use std::time::Duration;

pub struct Fetcher<'a> {
    client: Client,
    token: Option<String>,
    user_agent: String,
    http_retries: u32,
    backoff_sec: u64,
    max_backoff_sec: u64,
    caps: &'a dyn Capabilities,
}

impl<'a> Fetcher<'a> {
    pub fn new(cfg: &Config, caps: &'a dyn Capabilities) -> Result<Self, OtaError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_sec))
            .timeout(Duration::from_secs(cfg.http_timeout_sec))
            .build()
            .map_err(|e| OtaError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            token: cfg.token.clone(),
            user_agent: cfg.user_agent_or_default(),
            http_retries: cfg.http_retries,
            backoff_sec: cfg.backoff_sec,
            max_backoff_sec: cfg.max_backoff_sec,
            caps,
        })
    }

    fn headers(&self, raw: bool) -> Result<HeaderMap, OtaError> {
        let mut headers = HeaderMap::new();
        let accept = if raw {
            "application/octet-stream"
        } else {
            "application/vnd.github+json"
        };
        headers.insert(
            HeaderName::from_static("accept"),
            HeaderValue::from_str(accept).unwrap(),
        );
        headers.insert(
            HeaderName::from_static("user-agent"),
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| OtaError::Config(format!("bad user agent: {e}")))?,
        );
        if let Some(token) = &self.token {
            let value = format!("token {token}");
            headers.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&value)
                    .map_err(|e| OtaError::Config(format!("bad token: {e}")))?,
            );
        }
        Ok(headers)
    }

    /// Issues a GET with retry/backoff. Any HTTP status >= 400 is treated
    /// as a retryable failure until attempts are exhausted.
    pub fn get(&self, url: &str, raw: bool) -> Result<Response, OtaError> {
        let headers = self.headers(raw)?;
        let mut last_err = None;
        for attempt in 0..=self.http_retries {
            self.caps.wdt_feed();
            match self.client.get(url).headers(headers.clone()).send() {
                Ok(resp) if resp.status().as_u16() < 400 => return Ok(resp),
                Ok(resp) => {
                    last_err = Some(OtaError::Network(format!(
                        "HTTP {} fetching {url}",
                        resp.status()
                    )));
                }
                Err(e) => {
                    last_err = Some(OtaError::Network(format!("request to {url} failed: {e}")));
                }
            }
            if attempt < self.http_retries {
                let delay = backoff_delay(self.backoff_sec, self.max_backoff_sec, attempt);
                tracing::warn!(attempt, delay_sec = delay.as_secs(), url, "retrying fetch");
                self.caps.wdt_feed();
                sleep(delay);
            }
        }
        Err(last_err.unwrap_or_else(|| OtaError::Network(format!("exhausted retries for {url}"))))
    }

    pub fn get_json(&self, url: &str) -> Result<serde_json::Value, OtaError> {
        let resp = self.get(url, false)?;
        resp.json::<serde_json::Value>()
            .map_err(|e| OtaError::Network(format!("invalid json from {url}: {e}")))
    }
}

/// `min(backoff * 2^attempt, max_backoff)`, computed with a checked shift
/// so a pathologically high attempt count saturates instead of
/// overflowing (the original Python relies on unbounded float math here).
fn backoff_delay(backoff_sec: u64, max_backoff_sec: u64, attempt: u32) -> Duration {
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let scaled = backoff_sec.saturating_mul(multiplier);
    Duration::from_secs(scaled.min(max_backoff_sec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        assert_eq!(backoff_delay(3, 60, 0), Duration::from_secs(3));
        assert_eq!(backoff_delay(3, 60, 1), Duration::from_secs(6));
        assert_eq!(backoff_delay(3, 60, 2), Duration::from_secs(12));
        assert_eq!(backoff_delay(3, 60, 10), Duration::from_secs(60));
    }

    #[test]
    fn backoff_does_not_overflow_on_large_attempt() {
        let d = backoff_delay(3, 60, 1000);
        assert_eq!(d, Duration::from_secs(60));
    }
}
