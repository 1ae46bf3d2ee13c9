//! Score fusion.
//!
//! The header score (or 100 without header data) is the starting point and
//! the ceiling; every other module can only subtract from it. Rule
//! adjustments are applied last, then the result is clamped to 0..=100.

use super::report::ModuleResults;
use crate::analyzers::Severity;
use crate::rules::RuleAction;
use crate::spf::SpfResult;
use serde::Serialize;

const CLASSIFIER_WEIGHT: f64 = 30.0;
const PHISHING_WEIGHT: f64 = 0.5;
const REPUTATION_PENALTY: f64 = 25.0;
const REPUTATION_CAP: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deduction {
    pub module: String,
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub deductions: Vec<Deduction>,
    pub rule_adjustment: f64,
    pub score: u8,
}

pub fn spf_penalty(result: SpfResult) -> f64 {
    match result {
        SpfResult::Fail => 30.0,
        SpfResult::SoftFail => 15.0,
        SpfResult::PermError => 10.0,
        SpfResult::TempError | SpfResult::Neutral | SpfResult::None => 5.0,
        SpfResult::Pass => 0.0,
    }
}

pub fn blacklist_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Critical | Severity::High => 30.0,
        Severity::Medium => 20.0,
        Severity::Low => 10.0,
    }
}

pub fn fuse(results: &ModuleResults) -> ScoreBreakdown {
    let base = results
        .headers
        .as_ref()
        .map(|h| h.security_score)
        .unwrap_or(100.0);
    let mut deductions = Vec::new();
    let mut deduct = |module: &str, points: f64| {
        if points > 0.0 {
            deductions.push(Deduction {
                module: module.to_string(),
                points,
            });
        }
    };

    if let Some(spf) = &results.spf {
        deduct("spf", spf_penalty(spf.result));
    }
    if let Some(phishing) = &results.phishing {
        deduct("phishing", phishing.risk_score * PHISHING_WEIGHT);
    }
    if let Some(blacklist) = results.blacklist.as_ref().filter(|b| b.listed) {
        deduct(
            "blacklist",
            blacklist_penalty(blacklist.severity.unwrap_or(Severity::Medium)),
        );
    }
    if let Some(classification) = &results.classifier {
        let excess = (classification.spam_probability - 0.5).max(0.0);
        deduct("classifier", excess * 2.0 * CLASSIFIER_WEIGHT);
    }
    let malicious = results
        .reputation
        .iter()
        .filter(|f| f.verdict.malicious)
        .count() as f64;
    deduct("reputation", (malicious * REPUTATION_PENALTY).min(REPUTATION_CAP));

    let rule_adjustment: f64 = results
        .rules
        .iter()
        .flat_map(|m| m.actions.iter())
        .filter_map(|a| match a {
            RuleAction::AdjustScore { delta } => Some(*delta),
            _ => None,
        })
        .sum();

    let total_deducted: f64 = deductions.iter().map(|d| d.points).sum();
    let raw = base - total_deducted + rule_adjustment;
    let score = raw.clamp(0.0, 100.0).round() as u8;

    ScoreBreakdown {
        base,
        deductions,
        rule_adjustment,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::{BlacklistReport, HeaderReport, PhishingReport, ReputationVerdict};
    use crate::classifier::Classification;
    use crate::coordinator::report::{ReputationFinding, ReputationTarget};
    use crate::rules::RuleMatch;
    use crate::spf::SpfVerification;

    fn spf(result: SpfResult) -> SpfVerification {
        SpfVerification {
            result,
            domain: "example.com".to_string(),
            mechanism: None,
            lookups: 1,
            void_lookups: 0,
            warnings: Vec::new(),
        }
    }

    fn classification(p: f64) -> Classification {
        Classification {
            spam_probability: p,
            is_spam: p >= 0.9,
            confidence: (p - 0.5).abs() * 2.0,
            top_spam_tokens: Vec::new(),
            top_ham_tokens: Vec::new(),
            tokens_considered: 3,
        }
    }

    fn malicious(target: &str) -> ReputationFinding {
        ReputationFinding {
            target: target.to_string(),
            kind: ReputationTarget::Url,
            verdict: ReputationVerdict {
                malicious: true,
                positives: 5,
                total: 70,
            },
        }
    }

    #[test]
    fn test_no_data_scores_full() {
        let breakdown = fuse(&ModuleResults::default());
        assert_eq!(breakdown.score, 100);
        assert!(breakdown.deductions.is_empty());
    }

    #[test]
    fn test_documented_deductions() {
        let results = ModuleResults {
            headers: Some(HeaderReport {
                security_issues: Vec::new(),
                transport: Default::default(),
                security_score: 90.0,
            }),
            spf: Some(spf(SpfResult::SoftFail)),
            phishing: Some(PhishingReport {
                risk_score: 20.0,
                indicators: Vec::new(),
            }),
            blacklist: Some(BlacklistReport {
                listed: true,
                severity: Some(Severity::Low),
                zones: vec!["bl.spamcop.net".to_string()],
            }),
            classifier: Some(classification(0.75)),
            ..Default::default()
        };
        // 90 - 15 - 10 - 10 - 15
        let breakdown = fuse(&results);
        assert_eq!(breakdown.base, 90.0);
        assert_eq!(breakdown.score, 40);
        assert_eq!(breakdown.deductions.len(), 4);
    }

    #[test]
    fn test_ham_probability_never_adds() {
        let results = ModuleResults {
            classifier: Some(classification(0.01)),
            spf: Some(spf(SpfResult::Pass)),
            ..Default::default()
        };
        assert_eq!(fuse(&results).score, 100);
    }

    #[test]
    fn test_reputation_cap_rules_and_clamp() {
        let mut results = ModuleResults {
            reputation: vec![malicious("a"), malicious("b"), malicious("c")],
            ..Default::default()
        };
        assert_eq!(fuse(&results).score, 50);

        results.rules = vec![RuleMatch {
            rule_name: "trusted-partner".to_string(),
            priority: 1,
            actions: vec![RuleAction::AdjustScore { delta: 80.0 }],
        }];
        let breakdown = fuse(&results);
        assert_eq!(breakdown.rule_adjustment, 80.0);
        assert_eq!(breakdown.score, 100);

        results.rules[0].actions = vec![RuleAction::AdjustScore { delta: -90.0 }];
        assert_eq!(fuse(&results).score, 0);
    }

    #[test]
    fn test_spf_penalties() {
        assert_eq!(spf_penalty(SpfResult::Fail), 30.0);
        assert_eq!(spf_penalty(SpfResult::None), 5.0);
        assert_eq!(spf_penalty(SpfResult::Pass), 0.0);
    }
}
