//! Collaborators the coordinator dispatches to, and their built-in
//! implementations.

pub mod blacklist;
pub mod headers;
pub mod phishing;
pub mod reputation;
pub mod sanitizer;

use crate::message::HeaderMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub use blacklist::DnsBlacklistChecker;
pub use headers::TransportHeaderAnalyzer;
pub use phishing::HeuristicPhishingScorer;
pub use reputation::{HttpReputationClient, ReputationError};
pub use sanitizer::TagSanitizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationResults {
    pub spf: Option<String>,
    pub dkim: Option<String>,
    pub dmarc: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub hops: usize,
    pub tls: bool,
    pub authentication: AuthenticationResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderReport {
    pub security_issues: Vec<SecurityIssue>,
    pub transport: TransportInfo,
    /// 0 (hostile) to 100 (clean).
    pub security_score: f64,
}

#[async_trait]
pub trait HeaderAnalyzer: Send + Sync {
    async fn analyze_headers(&self, headers: &HeaderMap) -> anyhow::Result<HeaderReport>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhishingInput {
    pub subject: String,
    pub body: String,
    pub from: String,
    pub links: Vec<String>,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhishingReport {
    /// 0 to 100.
    pub risk_score: f64,
    pub indicators: Vec<String>,
}

#[async_trait]
pub trait PhishingScorer: Send + Sync {
    async fn analyze_email(&self, input: &PhishingInput) -> anyhow::Result<PhishingReport>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistReport {
    pub listed: bool,
    pub severity: Option<Severity>,
    pub zones: Vec<String>,
}

#[async_trait]
pub trait BlacklistChecker: Send + Sync {
    async fn check_ip(&self, address: IpAddr) -> anyhow::Result<BlacklistReport>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationVerdict {
    pub malicious: bool,
    pub positives: u32,
    pub total: u32,
}

#[async_trait]
pub trait ReputationClient: Send + Sync {
    async fn scan_url(&self, url: &str) -> Result<ReputationVerdict, ReputationError>;
    async fn scan_domain(&self, domain: &str) -> Result<ReputationVerdict, ReputationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeOptions {
    pub strip_tags: bool,
    pub remove_links: bool,
    pub max_length: Option<usize>,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            strip_tags: true,
            remove_links: false,
            max_length: None,
        }
    }
}

pub trait ContentSanitizer: Send + Sync {
    fn sanitize(&self, content: &str, options: &SanitizeOptions) -> String;
}
