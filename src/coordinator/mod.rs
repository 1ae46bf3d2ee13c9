//! Analysis coordinator.
//!
//! `Coordinator::analyze` is the single entry point: it parses the message,
//! runs the enabled analyzers concurrently under one deadline, performs the
//! rate-limited reputation lookups, evaluates rules and fuses everything
//! into a `SecurityReport`. It never returns an error; pipeline failures
//! produce a degraded report instead.

pub mod fusion;
pub mod report;

use crate::analyzers::{
    BlacklistChecker, BlacklistReport, ContentSanitizer, DnsBlacklistChecker, HeaderAnalyzer,
    HeaderReport, HeuristicPhishingScorer, HttpReputationClient, PhishingInput, PhishingReport,
    PhishingScorer, ReputationClient, ReputationError, SanitizeOptions, TagSanitizer,
    TransportHeaderAnalyzer,
};
use crate::classifier::{AdaptiveClassifier, Classification};
use crate::config::{Config, FailurePolicy};
use crate::dns::{DnsLookup, HickoryLookup};
use crate::error::{Result, SentinelError};
use crate::message::{extract_domain, link_domain, InboundMessage, MessageContext};
use crate::rules::{RuleAction, RuleEngine, RuleMatch};
use crate::spf::{SpfEvaluator, SpfVerification};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use fusion::{Deduction, ScoreBreakdown};
pub use report::{
    ModuleResults, ReputationFinding, ReputationTarget, RiskLevel, SecurityReport, Threat,
};

const DNS_TIMEOUT_SECONDS: u64 = 5;

enum ModuleOutput {
    Headers(HeaderReport),
    Spf(SpfVerification),
    Phishing(PhishingReport),
    Blacklist(BlacklistReport),
    Classifier(Classification),
}

type AnalyzerTask = JoinHandle<anyhow::Result<ModuleOutput>>;

#[derive(Default)]
struct Collected {
    results: ModuleResults,
    failed: Vec<String>,
    timed_out: Vec<String>,
}

impl Collected {
    fn record(&mut self, output: ModuleOutput) {
        let results = &mut self.results;
        match output {
            ModuleOutput::Headers(r) => results.headers = Some(r),
            ModuleOutput::Spf(r) => results.spf = Some(r),
            ModuleOutput::Phishing(r) => results.phishing = Some(r),
            ModuleOutput::Blacklist(r) => results.blacklist = Some(r),
            ModuleOutput::Classifier(r) => results.classifier = Some(r),
        }
    }
}

pub struct Coordinator {
    config: Config,
    spf: Arc<SpfEvaluator>,
    header_analyzer: Arc<dyn HeaderAnalyzer>,
    phishing_scorer: Arc<dyn PhishingScorer>,
    blacklist_checker: Arc<dyn BlacklistChecker>,
    reputation_client: Arc<dyn ReputationClient>,
    sanitizer: Arc<dyn ContentSanitizer>,
    classifier: Arc<RwLock<AdaptiveClassifier>>,
    rule_engine: Arc<RwLock<RuleEngine>>,
}

impl Coordinator {
    /// Coordinator with the built-in collaborators, resolving through `dns`.
    /// Loads `rules_file` when one is configured.
    pub fn new(config: Config, dns: Arc<dyn DnsLookup>) -> anyhow::Result<Self> {
        let reputation_client = HttpReputationClient::new(&config.reputation)?;
        let mut rule_engine = RuleEngine::new();
        if let Some(path) = &config.rules_file {
            rule_engine.load_rules(path)?;
        }

        Ok(Self {
            spf: Arc::new(SpfEvaluator::new(dns.clone(), config.spf.clone())),
            header_analyzer: Arc::new(TransportHeaderAnalyzer::new()),
            phishing_scorer: Arc::new(HeuristicPhishingScorer::new()),
            blacklist_checker: Arc::new(DnsBlacklistChecker::new(dns, config.blacklist.zones.clone())),
            reputation_client: Arc::new(reputation_client),
            sanitizer: Arc::new(TagSanitizer::new()),
            classifier: Arc::new(RwLock::new(AdaptiveClassifier::new(config.classifier.clone()))),
            rule_engine: Arc::new(RwLock::new(rule_engine)),
            config,
        })
    }

    /// Coordinator resolving through the system DNS configuration.
    pub fn from_system(config: Config) -> anyhow::Result<Self> {
        let dns = HickoryLookup::from_system_conf(DNS_TIMEOUT_SECONDS)?;
        Self::new(config, Arc::new(dns))
    }

    pub fn with_header_analyzer(mut self, analyzer: Arc<dyn HeaderAnalyzer>) -> Self {
        self.header_analyzer = analyzer;
        self
    }

    pub fn with_phishing_scorer(mut self, scorer: Arc<dyn PhishingScorer>) -> Self {
        self.phishing_scorer = scorer;
        self
    }

    pub fn with_blacklist_checker(mut self, checker: Arc<dyn BlacklistChecker>) -> Self {
        self.blacklist_checker = checker;
        self
    }

    pub fn with_reputation_client(mut self, client: Arc<dyn ReputationClient>) -> Self {
        self.reputation_client = client;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn ContentSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn classifier(&self) -> Arc<RwLock<AdaptiveClassifier>> {
        self.classifier.clone()
    }

    pub fn rule_engine(&self) -> Arc<RwLock<RuleEngine>> {
        self.rule_engine.clone()
    }

    pub fn spf_evaluator(&self) -> Arc<SpfEvaluator> {
        self.spf.clone()
    }

    /// Display-safe rendering of message content. Not part of `analyze`.
    pub fn sanitize(&self, content: &str, options: &SanitizeOptions) -> String {
        self.sanitizer.sanitize(content, options)
    }

    pub async fn analyze(&self, message: &InboundMessage) -> SecurityReport {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.run_pipeline(message))
            .catch_unwind()
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                log::error!("Analysis pipeline panicked: {reason}");
                return SecurityReport::degraded(&format!("analysis pipeline panicked: {reason}"));
            }
        };
        match outcome {
            Ok(report) => {
                log::info!(
                    "Analysis complete: score {} ({}) in {:?}{}",
                    report.score,
                    report.level,
                    started.elapsed(),
                    if report.partial { ", partial" } else { "" }
                );
                report
            }
            Err(e) => {
                log::error!("Analysis pipeline failed: {e}");
                SecurityReport::degraded(&e.to_string())
            }
        }
    }

    async fn run_pipeline(&self, message: &InboundMessage) -> Result<SecurityReport> {
        let mut ctx = MessageContext::from_inbound(message)?;

        let tasks = self.dispatch(&ctx);
        let collected = self.collect(tasks).await;
        if !collected.timed_out.is_empty() && self.config.analysis.failure_policy == FailurePolicy::Strict {
            return Ok(SecurityReport::timed_out(
                self.config.analysis.timeout_ms,
                collected.timed_out,
                collected.failed,
            ));
        }
        let Collected {
            mut results,
            failed,
            timed_out,
        } = collected;

        if self.config.analysis.enable_reputation {
            results.reputation = self.reputation_phase(&ctx).await;
        }

        attach_signals(&mut ctx, &results);
        if self.config.analysis.enable_rules {
            results.rules = self.evaluate_rules(&ctx)?;
        }
        for action in results.rules.iter().flat_map(|m| m.actions.iter()) {
            if let RuleAction::Tag { tag } = action {
                ctx.add_tag(tag);
            }
        }

        let breakdown = fusion::fuse(&results);
        let level = RiskLevel::from_score(breakdown.score);
        let threat_summary = report::compile_threats(&results);
        let recommendation = report::recommendation(level, &results.rules);

        Ok(SecurityReport {
            score: breakdown.score,
            level,
            module_results: results,
            score_breakdown: Some(breakdown),
            threat_summary,
            recommendation,
            tags: ctx.tags,
            partial: !timed_out.is_empty(),
            failed_modules: failed,
            timed_out_modules: timed_out,
            error: None,
            generated_at: chrono::Utc::now(),
        })
    }

    fn dispatch(&self, ctx: &MessageContext) -> Vec<(&'static str, AnalyzerTask)> {
        let analysis = &self.config.analysis;
        let mut tasks: Vec<(&'static str, AnalyzerTask)> = Vec::new();

        if analysis.enable_headers {
            let analyzer = self.header_analyzer.clone();
            let headers = ctx.headers.clone();
            tasks.push((
                "headers",
                tokio::spawn(async move {
                    analyzer.analyze_headers(&headers).await.map(ModuleOutput::Headers)
                }),
            ));
        }

        if analysis.enable_spf {
            match (ctx.client_ip.clone(), spf_domain(ctx)) {
                (Some(client), Some(domain)) => {
                    let spf = self.spf.clone();
                    let sender = ctx.sender_address().unwrap_or_default().to_string();
                    let helo = ctx.helo.clone();
                    tasks.push((
                        "spf",
                        tokio::spawn(async move {
                            let verification = spf.verify(&client, &domain, &sender, helo.as_deref()).await;
                            Ok(ModuleOutput::Spf(verification))
                        }),
                    ));
                }
                _ => log::debug!("SPF check skipped: client address or sender domain unknown"),
            }
        }

        if analysis.enable_phishing {
            let scorer = self.phishing_scorer.clone();
            let input = PhishingInput {
                subject: ctx.subject.clone(),
                body: ctx.body.clone(),
                from: ctx
                    .from_header
                    .clone()
                    .or_else(|| ctx.from.clone())
                    .unwrap_or_default(),
                links: ctx.links.clone(),
                headers: ctx.headers.clone(),
            };
            tasks.push((
                "phishing",
                tokio::spawn(async move { scorer.analyze_email(&input).await.map(ModuleOutput::Phishing) }),
            ));
        }

        if analysis.enable_blacklist {
            let client: Option<IpAddr> = ctx.client_ip.as_deref().and_then(|ip| ip.trim().parse().ok());
            if let Some(address) = client {
                let checker = self.blacklist_checker.clone();
                tasks.push((
                    "blacklist",
                    tokio::spawn(async move { checker.check_ip(address).await.map(ModuleOutput::Blacklist) }),
                ));
            }
        }

        if analysis.enable_classifier {
            let classifier = self.classifier.clone();
            let subject = ctx.subject.clone();
            let body = ctx.body.clone();
            let sender = ctx.sender_address().unwrap_or_default().to_string();
            tasks.push((
                "classifier",
                tokio::spawn(async move {
                    let classifier = classifier
                        .read()
                        .map_err(|_| anyhow::anyhow!("classifier lock poisoned"))?;
                    Ok::<_, anyhow::Error>(ModuleOutput::Classifier(
                        classifier.classify(&subject, &body, &sender),
                    ))
                }),
            ));
        }

        log::debug!(
            "Dispatched {} analyzers: {:?}",
            tasks.len(),
            tasks.iter().map(|(name, _)| *name).collect::<Vec<_>>()
        );
        tasks
    }

    /// Await every task against one shared deadline. Under the strict
    /// policy the first miss aborts everything still running.
    async fn collect(&self, tasks: Vec<(&'static str, AnalyzerTask)>) -> Collected {
        let timeout_ms = self.config.analysis.timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let strict = self.config.analysis.failure_policy == FailurePolicy::Strict;
        let mut collected = Collected::default();

        let mut tasks = tasks.into_iter();
        while let Some((name, mut task)) = tasks.next() {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(output))) => collected.record(output),
                Ok(Ok(Err(e))) => {
                    log::warn!("Analyzer '{name}' failed: {e:#}");
                    collected.failed.push(name.to_string());
                }
                Ok(Err(e)) => {
                    log::warn!("Analyzer '{name}' did not complete: {e}");
                    collected.failed.push(name.to_string());
                }
                Err(_) => {
                    log::warn!("Analyzer '{name}' missed the {timeout_ms}ms deadline");
                    task.abort();
                    collected.timed_out.push(name.to_string());
                    if strict {
                        for (rest, task) in tasks.by_ref() {
                            if !task.is_finished() {
                                collected.timed_out.push(rest.to_string());
                            }
                            task.abort();
                        }
                    }
                }
            }
        }
        collected
    }

    /// Sequential lookups with a fixed delay between requests. Failures are
    /// skipped; an unconfigured client ends the phase.
    async fn reputation_phase(&self, ctx: &MessageContext) -> Vec<ReputationFinding> {
        let config = &self.config.reputation;
        let mut targets: Vec<(ReputationTarget, String)> = ctx
            .links
            .iter()
            .map(|link| (ReputationTarget::Url, link.clone()))
            .collect();
        let mut seen = HashSet::new();
        for domain in ctx.links.iter().filter_map(|link| link_domain(link)) {
            if seen.insert(domain.clone()) {
                targets.push((ReputationTarget::Domain, domain));
            }
        }
        targets.truncate(config.max_lookups);

        let delay = Duration::from_millis(config.request_delay_ms);
        let mut findings = Vec::new();
        for (index, (kind, target)) in targets.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let verdict = match kind {
                ReputationTarget::Url => self.reputation_client.scan_url(&target).await,
                ReputationTarget::Domain => self.reputation_client.scan_domain(&target).await,
            };
            match verdict {
                Ok(verdict) => findings.push(ReputationFinding {
                    target,
                    kind,
                    verdict,
                }),
                Err(ReputationError::NotConfigured) => {
                    log::debug!("Reputation service not configured; skipping lookups");
                    break;
                }
                Err(e) => log::warn!("Reputation lookup for {target} failed: {e}"),
            }
        }
        findings
    }

    fn evaluate_rules(&self, ctx: &MessageContext) -> Result<Vec<RuleMatch>> {
        let engine = self
            .rule_engine
            .read()
            .map_err(|_| SentinelError::LockPoisoned("rule engine"))?;
        Ok(engine.evaluate(ctx))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Domain whose policy authorizes the client: envelope sender, then From, then HELO.
fn spf_domain(ctx: &MessageContext) -> Option<String> {
    ctx.sender_address()
        .and_then(extract_domain)
        .or_else(|| ctx.helo.clone())
}

/// Expose module results to rules as scores, metadata and tags.
fn attach_signals(ctx: &mut MessageContext, results: &ModuleResults) {
    if let Some(headers) = &results.headers {
        ctx.scores.insert("header_security".to_string(), headers.security_score);
        ctx.metadata.insert(
            "header_issue_count".to_string(),
            serde_json::Value::from(headers.security_issues.len()),
        );
    }
    if let Some(spf) = &results.spf {
        ctx.metadata.insert(
            "spf_result".to_string(),
            serde_json::Value::from(spf.result.to_string()),
        );
    }
    if let Some(phishing) = &results.phishing {
        ctx.scores.insert("phishing".to_string(), phishing.risk_score);
    }
    if let Some(blacklist) = &results.blacklist {
        ctx.metadata.insert("blacklisted".to_string(), serde_json::Value::from(blacklist.listed));
        if blacklist.listed {
            ctx.add_tag("blacklisted");
        }
    }
    if let Some(classification) = &results.classifier {
        ctx.scores.insert("spam".to_string(), classification.spam_probability);
        if classification.is_spam {
            ctx.add_tag("spam");
        }
    }
    let malicious = results.reputation.iter().filter(|f| f.verdict.malicious).count();
    ctx.scores.insert("reputation_malicious".to_string(), malicious as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::ReputationVerdict;
    use crate::dns::StaticLookup;
    use crate::message::HeaderMap;
    use crate::rules::{Condition, ConditionValue, Operator, Rule};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn raw_message(subject: &str, body: &str) -> String {
        format!(
            "From: Alice <alice@example.com>\r\nTo: bob@example.org\r\nSubject: {subject}\r\nMessage-ID: <1@example.com>\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\n{body}\r\n"
        )
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.analysis.timeout_ms = 2_000;
        config.reputation.request_delay_ms = 0;
        config
    }

    fn coordinator(config: Config, dns: StaticLookup) -> Coordinator {
        Coordinator::new(config, Arc::new(dns)).unwrap()
    }

    struct HangingHeaders;

    #[async_trait]
    impl HeaderAnalyzer for HangingHeaders {
        async fn analyze_headers(&self, _headers: &HeaderMap) -> anyhow::Result<HeaderReport> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::bail!("woke up after the deadline")
        }
    }

    struct FailingHeaders;

    #[async_trait]
    impl HeaderAnalyzer for FailingHeaders {
        async fn analyze_headers(&self, _headers: &HeaderMap) -> anyhow::Result<HeaderReport> {
            anyhow::bail!("header backend unavailable")
        }
    }

    struct PanickingPhishing;

    #[async_trait]
    impl PhishingScorer for PanickingPhishing {
        async fn analyze_email(&self, _input: &PhishingInput) -> anyhow::Result<PhishingReport> {
            panic!("phishing scorer crashed")
        }
    }

    #[derive(Default)]
    struct RecordingReputation {
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl RecordingReputation {
        fn answer(&self, target: &str) -> std::result::Result<ReputationVerdict, ReputationError> {
            self.calls.lock().unwrap().push((target.to_string(), Instant::now()));
            if target.contains("first") {
                return Err(ReputationError::Network("connection reset".to_string()));
            }
            Ok(ReputationVerdict {
                malicious: true,
                positives: 4,
                total: 70,
            })
        }
    }

    #[async_trait]
    impl ReputationClient for RecordingReputation {
        async fn scan_url(&self, url: &str) -> std::result::Result<ReputationVerdict, ReputationError> {
            self.answer(url)
        }

        async fn scan_domain(&self, domain: &str) -> std::result::Result<ReputationVerdict, ReputationError> {
            self.answer(domain)
        }
    }

    #[tokio::test]
    async fn test_unparseable_message_yields_unknown() {
        let coordinator = coordinator(test_config(), StaticLookup::new());
        for raw in ["", "this line has no header separator\n\nbody"] {
            let report = coordinator.analyze(&InboundMessage::new(raw)).await;
            assert_eq!(report.level, RiskLevel::Unknown);
            assert_eq!(report.score, 50);
            assert!(report.error.is_some());
        }
    }

    struct ExplodingPredicate;

    impl crate::rules::Predicate for ExplodingPredicate {
        fn evaluate(&self, _ctx: &MessageContext, _argument: Option<&ConditionValue>) -> bool {
            panic!("predicate backend crashed")
        }
    }

    #[tokio::test]
    async fn test_panic_inside_pipeline_yields_degraded_report() {
        let coordinator = coordinator(test_config(), StaticLookup::new());
        {
            let engine = coordinator.rule_engine();
            let mut engine = engine.write().unwrap();
            engine.register_predicate("exploding", Box::new(ExplodingPredicate));
            engine.add_rule(Rule::new("explode", 1).when(Condition::custom("exploding", None)));
        }

        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Hello", "Just checking in.")))
            .await;
        assert_eq!(report.level, RiskLevel::Unknown);
        assert_eq!(report.score, 50);
        assert!(report.error.as_deref().unwrap_or_default().contains("predicate backend crashed"));

        // A read guard does not poison the lock, so later messages still run.
        coordinator.rule_engine().write().unwrap().remove_rule("explode");
        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Hello", "Just checking in.")))
            .await;
        assert_ne!(report.level, RiskLevel::Unknown);
    }

    #[tokio::test]
    async fn test_hanging_analyzer_strict_returns_fallback() {
        let mut config = test_config();
        config.analysis.timeout_ms = 200;
        let coordinator = coordinator(config, StaticLookup::new()).with_header_analyzer(Arc::new(HangingHeaders));

        let started = Instant::now();
        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Hello", "Just checking in.")))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.level, RiskLevel::Unknown);
        assert_eq!(report.score, 50);
        assert_eq!(report.timed_out_modules, vec!["headers"]);
        assert!(report.module_results.phishing.is_none());
    }

    #[tokio::test]
    async fn test_hanging_analyzer_partial_keeps_finished_results() {
        let mut config = test_config();
        config.analysis.timeout_ms = 200;
        config.analysis.failure_policy = FailurePolicy::Partial;
        let coordinator = coordinator(config, StaticLookup::new()).with_header_analyzer(Arc::new(HangingHeaders));

        let started = Instant::now();
        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Hello", "Just checking in.")))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.partial);
        assert_eq!(report.timed_out_modules, vec!["headers"]);
        assert!(report.module_results.headers.is_none());
        assert!(report.module_results.phishing.is_some());
        assert!(report.module_results.classifier.is_some());
        assert_eq!(report.level, RiskLevel::Safe);
    }

    #[tokio::test]
    async fn test_failing_analyzers_contribute_nothing() {
        let coordinator = coordinator(test_config(), StaticLookup::new())
            .with_header_analyzer(Arc::new(FailingHeaders))
            .with_phishing_scorer(Arc::new(PanickingPhishing));

        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Hello", "Just checking in.")))
            .await;
        assert_eq!(report.failed_modules, vec!["headers", "phishing"]);
        assert!(!report.partial);
        assert_eq!(report.score, 100);
        assert_eq!(report.level, RiskLevel::Safe);
    }

    #[tokio::test]
    async fn test_spf_fail_and_blacklist_fused() {
        let dns = StaticLookup::new()
            .with_txt("example.com", "v=spf1 ip4:198.51.100.0/24 -all")
            .with_ip("1.2.0.192.zen.spamhaus.org", "127.0.0.2".parse().unwrap());
        let coordinator = coordinator(test_config(), dns);

        let message = InboundMessage::new(raw_message("Quarterly numbers", "See attached summary."))
            .with_client_ip("192.0.2.1")
            .with_envelope_from("alice@example.com");
        let report = coordinator.analyze(&message).await;

        let spf = report.module_results.spf.as_ref().unwrap();
        assert_eq!(spf.result, crate::spf::SpfResult::Fail);
        assert!(report.module_results.blacklist.as_ref().unwrap().listed);
        // 95 (no auth results) - 30 (spf fail) - 20 (medium listing)
        assert_eq!(report.score, 45);
        assert_eq!(report.level, RiskLevel::Medium);
        assert_eq!(report.threat_summary[0].source, "spf");
        assert_eq!(report.threat_summary[1].source, "blacklist");
        assert!(report.tags.contains(&"blacklisted".to_string()));
        assert!(report.module_results.reputation.is_empty());
    }

    #[tokio::test]
    async fn test_rule_actions_applied() {
        let coordinator = coordinator(test_config(), StaticLookup::new());
        coordinator.rule_engine().write().unwrap().add_rule(
            Rule::new("finance-review", 10)
                .when(Condition::field(
                    "subject",
                    Operator::Contains,
                    ConditionValue::Text("invoice".to_string()),
                ))
                .when(Condition::score("phishing", Operator::Lt, 10.0))
                .then(RuleAction::Tag {
                    tag: "finance".to_string(),
                })
                .then(RuleAction::AdjustScore { delta: -10.0 })
                .then(RuleAction::Quarantine),
        );

        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Invoice 42", "Please find the invoice attached.")))
            .await;
        assert_eq!(report.module_results.rules.len(), 1);
        assert_eq!(report.score, 85);
        assert!(report.tags.contains(&"finance".to_string()));
        assert_eq!(report.recommendation, "Quarantine this message pending review");
    }

    #[tokio::test]
    async fn test_reputation_phase_sequential_and_tolerant() {
        let mut config = test_config();
        config.reputation.request_delay_ms = 50;
        let reputation = Arc::new(RecordingReputation::default());
        let coordinator = coordinator(config, StaticLookup::new()).with_reputation_client(reputation.clone());

        let body = "See https://files.example.net/first and https://files.example.net/second";
        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Shared files", body)))
            .await;

        let calls = reputation.calls.lock().unwrap().clone();
        let targets: Vec<&str> = calls.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            targets,
            vec![
                "https://files.example.net/first",
                "https://files.example.net/second",
                "files.example.net"
            ]
        );
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(50));
        }
        assert_eq!(report.module_results.reputation.len(), 2);
        // 95 - 50 (two malicious findings, capped)
        assert_eq!(report.score, 45);
    }

    #[tokio::test]
    async fn test_trained_classifier_used() {
        let coordinator = coordinator(test_config(), StaticLookup::new());
        {
            let classifier = coordinator.classifier();
            let mut classifier = classifier.write().unwrap();
            classifier.train_spam("Cheap pills", "Buy cheap pills now", "promo@pharma.example");
            classifier.train_ham("Team lunch", "Lunch with the team tomorrow", "alice@example.com");
        }

        let report = coordinator
            .analyze(&InboundMessage::new(raw_message("Cheap pills", "Buy cheap pills now")))
            .await;
        let classification = report.module_results.classifier.unwrap();
        assert!(classification.spam_probability > 0.5);
    }

    #[test]
    fn test_sanitize_passthrough() {
        let coordinator = coordinator(test_config(), StaticLookup::new());
        let text = coordinator.sanitize("<p>Hi</p>", &SanitizeOptions::default());
        assert_eq!(text, "Hi");
    }
}
