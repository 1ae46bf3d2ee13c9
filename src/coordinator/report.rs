use crate::analyzers::{
    BlacklistReport, HeaderReport, PhishingReport, ReputationVerdict, Severity,
};
use crate::classifier::Classification;
use crate::rules::{RuleAction, RuleMatch};
use crate::spf::{SpfResult, SpfVerification};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::fusion::ScoreBreakdown;

const MAX_THREATS: usize = 5;
pub const DEGRADED_SCORE: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => RiskLevel::Safe,
            60..=79 => RiskLevel::Low,
            40..=59 => RiskLevel::Medium,
            20..=39 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
            RiskLevel::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReputationTarget {
    Url,
    Domain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationFinding {
    pub target: String,
    pub kind: ReputationTarget,
    pub verdict: ReputationVerdict,
}

/// Per-module outputs. `None` means the module was disabled, not
/// applicable, failed, or did not finish in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleResults {
    pub headers: Option<HeaderReport>,
    pub spf: Option<SpfVerification>,
    pub phishing: Option<PhishingReport>,
    pub blacklist: Option<BlacklistReport>,
    pub classifier: Option<Classification>,
    pub reputation: Vec<ReputationFinding>,
    pub rules: Vec<RuleMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threat {
    pub source: String,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityReport {
    pub score: u8,
    pub level: RiskLevel,
    pub module_results: ModuleResults,
    pub score_breakdown: Option<ScoreBreakdown>,
    pub threat_summary: Vec<Threat>,
    pub recommendation: String,
    pub tags: Vec<String>,
    /// Some modules missed the deadline and their results are absent.
    pub partial: bool,
    pub failed_modules: Vec<String>,
    pub timed_out_modules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl SecurityReport {
    /// Report for a pipeline that could not run at all.
    pub fn degraded(reason: &str) -> Self {
        Self {
            score: DEGRADED_SCORE,
            level: RiskLevel::Unknown,
            module_results: ModuleResults::default(),
            score_breakdown: None,
            threat_summary: Vec::new(),
            recommendation: "Analysis could not be completed; review this message manually"
                .to_string(),
            tags: Vec::new(),
            partial: false,
            failed_modules: Vec::new(),
            timed_out_modules: Vec::new(),
            error: Some(reason.to_string()),
            generated_at: Utc::now(),
        }
    }

    /// Report returned when the concurrent phase misses its deadline under
    /// the strict policy.
    pub fn timed_out(timeout_ms: u64, timed_out_modules: Vec<String>, failed_modules: Vec<String>) -> Self {
        Self {
            score: DEGRADED_SCORE,
            level: RiskLevel::Unknown,
            module_results: ModuleResults::default(),
            score_breakdown: None,
            threat_summary: Vec::new(),
            recommendation: format!(
                "Analysis did not finish within {timeout_ms}ms; treat with caution and review manually"
            ),
            tags: Vec::new(),
            partial: false,
            failed_modules,
            timed_out_modules,
            error: None,
            generated_at: Utc::now(),
        }
    }
}

fn spf_threat(spf: &SpfVerification) -> Option<Threat> {
    let (severity, description) = match spf.result {
        SpfResult::Fail => (
            Severity::High,
            format!("Sender not authorized by the SPF policy of {}", spf.domain),
        ),
        SpfResult::SoftFail => (
            Severity::Medium,
            format!("SPF policy of {} marks the sender as suspicious", spf.domain),
        ),
        SpfResult::PermError => (
            Severity::Low,
            format!("SPF policy of {} is invalid", spf.domain),
        ),
        _ => return None,
    };
    Some(Threat {
        source: "spf".to_string(),
        description,
        severity,
    })
}

/// Most severe findings first, at most five.
pub fn compile_threats(results: &ModuleResults) -> Vec<Threat> {
    let mut threats = Vec::new();

    for rule in &results.rules {
        for action in &rule.actions {
            if let RuleAction::ReportThreat {
                description,
                severity,
            } = action
            {
                threats.push(Threat {
                    source: format!("rule:{}", rule.rule_name),
                    description: description.clone(),
                    severity: Severity::parse(severity).unwrap_or(Severity::Medium),
                });
            }
        }
    }

    for finding in results.reputation.iter().filter(|f| f.verdict.malicious) {
        threats.push(Threat {
            source: "reputation".to_string(),
            description: format!(
                "{} flagged by {} of {} engines",
                finding.target, finding.verdict.positives, finding.verdict.total
            ),
            severity: Severity::High,
        });
    }

    if let Some(blacklist) = results.blacklist.as_ref().filter(|b| b.listed) {
        threats.push(Threat {
            source: "blacklist".to_string(),
            description: format!("Client address listed on {}", blacklist.zones.join(", ")),
            severity: blacklist.severity.unwrap_or(Severity::Medium),
        });
    }

    if let Some(threat) = results.spf.as_ref().and_then(spf_threat) {
        threats.push(threat);
    }

    if let Some(phishing) = &results.phishing {
        let severity = if phishing.risk_score >= 70.0 {
            Severity::High
        } else if phishing.risk_score >= 40.0 {
            Severity::Medium
        } else {
            Severity::Low
        };
        threats.extend(phishing.indicators.iter().map(|indicator| Threat {
            source: "phishing".to_string(),
            description: indicator.clone(),
            severity,
        }));
    }

    if let Some(classification) = results.classifier.as_ref().filter(|c| c.is_spam) {
        threats.push(Threat {
            source: "classifier".to_string(),
            description: format!(
                "Classified as spam (probability {:.2})",
                classification.spam_probability
            ),
            severity: Severity::Medium,
        });
    }

    if let Some(headers) = &results.headers {
        threats.extend(headers.security_issues.iter().map(|issue| Threat {
            source: "headers".to_string(),
            description: issue.description.clone(),
            severity: issue.severity,
        }));
    }

    threats.sort_by(|a, b| b.severity.cmp(&a.severity));
    threats.truncate(MAX_THREATS);
    threats
}

pub fn recommendation(level: RiskLevel, rules: &[RuleMatch]) -> String {
    let actions = || rules.iter().flat_map(|m| m.actions.iter());
    if let Some(message) = actions().find_map(|a| match a {
        RuleAction::Reject { message } => Some(message.clone()),
        _ => None,
    }) {
        return format!("Reject: {message}");
    }
    if actions().any(|a| matches!(a, RuleAction::Quarantine)) {
        return "Quarantine this message pending review".to_string();
    }
    match level {
        RiskLevel::Safe => "No action needed".to_string(),
        RiskLevel::Low => "Deliver normally; minor concerns were noted".to_string(),
        RiskLevel::Medium => "Deliver with caution and warn the recipient".to_string(),
        RiskLevel::High => "Quarantine recommended".to_string(),
        RiskLevel::Critical => "Block this message".to_string(),
        RiskLevel::Unknown => "Review this message manually".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::SecurityIssue;

    #[test]
    fn test_level_boundaries() {
        assert_eq!(RiskLevel::from_score(100), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(80), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(79), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(60), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(20), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(19), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Critical);
    }

    #[test]
    fn test_threats_sorted_and_capped() {
        let results = ModuleResults {
            headers: Some(HeaderReport {
                security_issues: (0..4)
                    .map(|i| SecurityIssue {
                        severity: Severity::Low,
                        description: format!("issue {i}"),
                    })
                    .collect(),
                transport: Default::default(),
                security_score: 80.0,
            }),
            blacklist: Some(BlacklistReport {
                listed: true,
                severity: Some(Severity::High),
                zones: vec!["zen.spamhaus.org".to_string()],
            }),
            rules: vec![RuleMatch {
                rule_name: "ceo-fraud".to_string(),
                priority: 10,
                actions: vec![RuleAction::ReportThreat {
                    description: "Executive impersonation".to_string(),
                    severity: "critical".to_string(),
                }],
            }],
            ..Default::default()
        };
        let threats = compile_threats(&results);
        assert_eq!(threats.len(), 5);
        assert_eq!(threats[0].severity, Severity::Critical);
        assert_eq!(threats[0].source, "rule:ceo-fraud");
        assert_eq!(threats[1].source, "blacklist");
        assert!(threats[2..].iter().all(|t| t.severity == Severity::Low));
    }

    #[test]
    fn test_rule_actions_override_recommendation() {
        let reject = vec![RuleMatch {
            rule_name: "r".to_string(),
            priority: 1,
            actions: vec![RuleAction::Quarantine, RuleAction::Reject { message: "Blocked sender".to_string() }],
        }];
        assert_eq!(recommendation(RiskLevel::Safe, &reject), "Reject: Blocked sender");
        let quarantine = vec![RuleMatch {
            rule_name: "q".to_string(),
            priority: 1,
            actions: vec![RuleAction::Quarantine],
        }];
        assert_eq!(
            recommendation(RiskLevel::Safe, &quarantine),
            "Quarantine this message pending review"
        );
        assert_eq!(recommendation(RiskLevel::Critical, &[]), "Block this message");
    }

    #[test]
    fn test_degraded_report_shape() {
        let report = SecurityReport::degraded("message parse error");
        assert_eq!(report.score, 50);
        assert_eq!(report.level, RiskLevel::Unknown);
        assert!(report.recommendation.contains("manually"));
        assert_eq!(report.error.as_deref(), Some("message parse error"));
    }
}
