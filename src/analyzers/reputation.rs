use super::{ReputationClient, ReputationVerdict};
use crate::config::ReputationConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReputationError {
    /// No endpoint configured; the lookup phase is skipped.
    #[error("Reputation service not configured")]
    NotConfigured,
    #[error("Reputation service rate limit reached")]
    RateLimited,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ReputationError {
    fn from(e: reqwest::Error) -> Self {
        ReputationError::Network(e.to_string())
    }
}

/// Client for a JSON scanning API answering `GET <endpoint>/<kind>?resource=..`
/// with `{"positives": n, "total": m}`.
pub struct HttpReputationClient {
    client: Client,
    endpoint: Option<Url>,
    api_key: Option<String>,
}

impl HttpReputationClient {
    pub fn new(config: &ReputationConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("mail-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let endpoint = match config.endpoint.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                let mut url = Url::parse(raw)
                    .map_err(|e| anyhow::anyhow!("Invalid reputation endpoint '{raw}': {e}"))?;
                if !url.path().ends_with('/') {
                    let path = format!("{}/", url.path());
                    url.set_path(&path);
                }
                Some(url)
            }
            _ => None,
        };
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    fn request_url(&self, kind: &str, resource: &str) -> Result<Url, ReputationError> {
        let endpoint = self.endpoint.as_ref().ok_or(ReputationError::NotConfigured)?;
        let mut url = endpoint
            .join(kind)
            .map_err(|e| ReputationError::InvalidResponse(format!("bad request url: {e}")))?;
        url.query_pairs_mut().append_pair("resource", resource);
        Ok(url)
    }

    async fn scan(&self, kind: &str, resource: &str) -> Result<ReputationVerdict, ReputationError> {
        let url = self.request_url(kind, resource)?;
        log::debug!("Reputation lookup: {kind} {resource}");

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-apikey", key);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(ReputationError::RateLimited),
            status if !status.is_success() => {
                return Err(ReputationError::Network(format!("HTTP {status}")));
            }
            _ => {}
        }
        let body: serde_json::Value = response.json().await?;
        parse_verdict(&body)
    }
}

pub fn parse_verdict(body: &serde_json::Value) -> Result<ReputationVerdict, ReputationError> {
    let field = |name: &str| {
        body.get(name)
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ReputationError::InvalidResponse(format!("missing '{name}'")))
    };
    let positives = u32::try_from(field("positives")?).unwrap_or(u32::MAX);
    let total = u32::try_from(field("total")?).unwrap_or(u32::MAX);
    Ok(ReputationVerdict {
        malicious: positives > 0,
        positives,
        total,
    })
}

#[async_trait]
impl ReputationClient for HttpReputationClient {
    async fn scan_url(&self, url: &str) -> Result<ReputationVerdict, ReputationError> {
        self.scan("url", url).await
    }

    async fn scan_domain(&self, domain: &str) -> Result<ReputationVerdict, ReputationError> {
        self.scan("domain", domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_without_endpoint_is_not_configured() {
        let client = HttpReputationClient::new(&ReputationConfig::default()).unwrap();
        assert!(!client.is_configured());
        assert_eq!(
            client.scan_url("https://example.com").await,
            Err(ReputationError::NotConfigured)
        );
        assert_eq!(
            client.scan_domain("example.com").await,
            Err(ReputationError::NotConfigured)
        );
    }

    #[test]
    fn test_request_url() {
        let config = ReputationConfig {
            endpoint: Some("https://scanner.example/api/v1".to_string()),
            ..Default::default()
        };
        let client = HttpReputationClient::new(&config).unwrap();
        let url = client.request_url("url", "https://a.example/x?y=1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://scanner.example/api/v1/url?resource=https%3A%2F%2Fa.example%2Fx%3Fy%3D1"
        );
    }

    #[test]
    fn test_parse_verdict() {
        let verdict = parse_verdict(&serde_json::json!({"positives": 3, "total": 70})).unwrap();
        assert!(verdict.malicious);
        assert_eq!(verdict.total, 70);
        let clean = parse_verdict(&serde_json::json!({"positives": 0, "total": 70})).unwrap();
        assert!(!clean.malicious);
        assert!(parse_verdict(&serde_json::json!({"total": 70})).is_err());
    }
}
