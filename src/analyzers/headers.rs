use super::{AuthenticationResults, HeaderAnalyzer, HeaderReport, SecurityIssue, Severity, TransportInfo};
use crate::message::{extract_domain, extract_email_address, HeaderMap};
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

const MAX_NORMAL_HOPS: usize = 15;

fn auth_result_regex() -> &'static Regex {
    static AUTH: OnceLock<Regex> = OnceLock::new();
    AUTH.get_or_init(|| {
        Regex::new(r"(?i)\b(spf|dkim|dmarc)\s*=\s*([a-z]+)").expect("auth result pattern is valid")
    })
}

fn severity_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 5.0,
        Severity::Medium => 15.0,
        Severity::High => 25.0,
        Severity::Critical => 40.0,
    }
}

/// Reads the transport path and authentication verdicts recorded by
/// upstream MTAs. Nothing here touches the network.
#[derive(Debug, Default)]
pub struct TransportHeaderAnalyzer;

impl TransportHeaderAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn parse_authentication(headers: &HeaderMap) -> AuthenticationResults {
        let mut results = AuthenticationResults::default();
        for value in headers.get_all("authentication-results") {
            for caps in auth_result_regex().captures_iter(value) {
                let verdict = caps[2].to_lowercase();
                let slot = match caps[1].to_lowercase().as_str() {
                    "spf" => &mut results.spf,
                    "dkim" => &mut results.dkim,
                    _ => &mut results.dmarc,
                };
                // First verdict wins; it comes from the closest trusted MTA.
                slot.get_or_insert(verdict);
            }
        }
        if results.spf.is_none() {
            if let Some(received_spf) = headers.get_first("received-spf") {
                results.spf = received_spf
                    .split_whitespace()
                    .next()
                    .map(|v| v.to_lowercase());
            }
        }
        results
    }

    fn check_authentication(auth: &AuthenticationResults, issues: &mut Vec<SecurityIssue>) {
        if auth.spf.is_none() && auth.dkim.is_none() && auth.dmarc.is_none() {
            issues.push(issue(Severity::Low, "No authentication results recorded"));
            return;
        }
        for (name, verdict) in [("SPF", &auth.spf), ("DKIM", &auth.dkim), ("DMARC", &auth.dmarc)] {
            match verdict.as_deref() {
                Some("fail") => issues.push(issue(Severity::High, &format!("{name} authentication failed"))),
                Some("softfail") => issues.push(issue(Severity::Medium, &format!("{name} soft failure"))),
                Some("permerror") | Some("temperror") => {
                    issues.push(issue(Severity::Low, &format!("{name} evaluation error")))
                }
                _ => {}
            }
        }
    }
}

fn issue(severity: Severity, description: &str) -> SecurityIssue {
    SecurityIssue {
        severity,
        description: description.to_string(),
    }
}

#[async_trait]
impl HeaderAnalyzer for TransportHeaderAnalyzer {
    async fn analyze_headers(&self, headers: &HeaderMap) -> anyhow::Result<HeaderReport> {
        let mut issues = Vec::new();

        let received = headers.get_all("received");
        let hops = received.len();
        let tls = received.iter().any(|hop| {
            let lower = hop.to_lowercase();
            lower.contains("esmtps") || lower.contains("tls")
        });
        if hops > MAX_NORMAL_HOPS {
            issues.push(issue(Severity::Medium, &format!("Unusually long relay path ({hops} hops)")));
        }
        if hops > 0 && !tls {
            issues.push(issue(Severity::Low, "Message was relayed without TLS"));
        }

        let authentication = Self::parse_authentication(headers);
        Self::check_authentication(&authentication, &mut issues);

        if !headers.contains("message-id") {
            issues.push(issue(Severity::Low, "Missing Message-ID header"));
        }
        if !headers.contains("date") {
            issues.push(issue(Severity::Low, "Missing Date header"));
        }

        let from_domain = headers
            .get_first("from")
            .and_then(extract_email_address)
            .and_then(|a| extract_domain(&a));
        let reply_domain = headers
            .get_first("reply-to")
            .and_then(extract_email_address)
            .and_then(|a| extract_domain(&a));
        if let (Some(from), Some(reply)) = (&from_domain, &reply_domain) {
            if from != reply {
                issues.push(issue(
                    Severity::Medium,
                    &format!("Reply-To domain {reply} differs from From domain {from}"),
                ));
            }
        }

        let penalty: f64 = issues.iter().map(|i| severity_penalty(i.severity)).sum();
        let security_score = (100.0 - penalty).clamp(0.0, 100.0);
        log::debug!(
            "Header analysis: {hops} hops, tls={tls}, {} issues, score {security_score}",
            issues.len()
        );

        Ok(HeaderReport {
            security_issues: issues,
            transport: TransportInfo {
                hops,
                tls,
                authentication,
            },
            security_score,
        })
    }
}
