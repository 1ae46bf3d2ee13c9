use super::{PhishingInput, PhishingReport, PhishingScorer};
use crate::message::{extract_domain, extract_email_address, link_domain};
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

const URGENCY_PATTERNS: &[&str] = &[
    "urgent",
    "immediately",
    "action required",
    "account suspended",
    "account will be closed",
    "within 24 hours",
    "final notice",
    "unusual activity",
];

const CREDENTIAL_PATTERNS: &[&str] = &[
    "verify your account",
    "verify your identity",
    "confirm your password",
    "update your payment",
    "login credentials",
    "social security number",
    "credit card number",
    "enter your password",
];

const SHORTENERS: &[&str] = &[
    "bit.ly", "tinyurl.com", "t.co", "goo.gl", "ow.ly", "is.gd", "v.gd", "tiny.cc", "rb.gy",
    "cutt.ly", "shorturl.at", "u.to",
];

const RISKY_TLDS: &[&str] = &["zip", "xyz", "top", "click", "tk", "gq", "ml", "cf", "work"];

const BRANDS: &[(&str, &str)] = &[
    ("paypal", "paypal.com"),
    ("apple", "apple.com"),
    ("microsoft", "microsoft.com"),
    ("amazon", "amazon.com"),
    ("netflix", "netflix.com"),
    ("google", "google.com"),
    ("docusign", "docusign.net"),
    ("wells fargo", "wellsfargo.com"),
];

fn ip_link_regex() -> &'static Regex {
    static IP_LINK: OnceLock<Regex> = OnceLock::new();
    IP_LINK.get_or_init(|| {
        Regex::new(r"(?i)^https?://\d{1,3}(\.\d{1,3}){3}([:/]|$)").expect("ip link pattern is valid")
    })
}

/// Keyword and link heuristics. Each indicator family contributes once.
#[derive(Debug, Default)]
pub struct HeuristicPhishingScorer;

impl HeuristicPhishingScorer {
    pub fn new() -> Self {
        Self
    }

    fn brand_mismatch(from: &str) -> Option<String> {
        let lower = from.to_lowercase();
        let display_name = lower.split('<').next().unwrap_or_default();
        let domain = extract_email_address(from).and_then(|a| extract_domain(&a))?;
        BRANDS.iter().find_map(|(brand, official)| {
            let claims_brand = display_name.contains(brand);
            let official_sender = domain == *official || domain.ends_with(&format!(".{official}"));
            (claims_brand && !official_sender)
                .then(|| format!("Display name claims {brand} but sender domain is {domain}"))
        })
    }

    fn lookalike_link(host: &str) -> Option<&'static str> {
        BRANDS.iter().find_map(|(brand, official)| {
            let compact = brand.replace(' ', "");
            let mentions = host.contains(&compact);
            let official_host = host == *official || host.ends_with(&format!(".{official}"));
            (mentions && !official_host).then_some(*brand)
        })
    }
}

#[async_trait]
impl PhishingScorer for HeuristicPhishingScorer {
    async fn analyze_email(&self, input: &PhishingInput) -> anyhow::Result<PhishingReport> {
        let text = format!("{} {}", input.subject, input.body).to_lowercase();
        let mut score = 0.0;
        let mut indicators = Vec::new();

        if let Some(hit) = URGENCY_PATTERNS.iter().find(|p| text.contains(*p)) {
            score += 15.0;
            indicators.push(format!("Urgency language: '{hit}'"));
        }
        if let Some(hit) = CREDENTIAL_PATTERNS.iter().find(|p| text.contains(*p)) {
            score += 20.0;
            indicators.push(format!("Credential request: '{hit}'"));
        }
        if let Some(reason) = Self::brand_mismatch(&input.from) {
            score += 30.0;
            indicators.push(reason);
        }

        let mut ip_links = false;
        let mut shortened = false;
        let mut risky_tld = false;
        let mut lookalike = None;
        for link in &input.links {
            if ip_link_regex().is_match(link) {
                ip_links = true;
                continue;
            }
            let Some(host) = link_domain(link) else {
                continue;
            };
            if SHORTENERS.iter().any(|s| host == *s) {
                shortened = true;
            }
            if host
                .rsplit('.')
                .next()
                .is_some_and(|tld| RISKY_TLDS.contains(&tld))
            {
                risky_tld = true;
            }
            if lookalike.is_none() {
                lookalike = Self::lookalike_link(&host).map(|brand| (brand, host.clone()));
            }
        }
        if ip_links {
            score += 25.0;
            indicators.push("Link points at a raw IP address".to_string());
        }
        if shortened {
            score += 10.0;
            indicators.push("Link uses a URL shortener".to_string());
        }
        if risky_tld {
            score += 10.0;
            indicators.push("Link uses a high-risk top-level domain".to_string());
        }
        if let Some((brand, host)) = lookalike {
            score += 20.0;
            indicators.push(format!("Link host {host} imitates {brand}"));
        }

        let risk_score: f64 = f64::min(score, 100.0);
        log::debug!("Phishing heuristics: score {risk_score}, {} indicators", indicators.len());
        Ok(PhishingReport {
            risk_score,
            indicators,
        })
    }
}
