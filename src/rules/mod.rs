//! Declarative rule evaluation.
//!
//! Rules are kept in descending priority order (insertion order for ties).
//! Every condition of a rule must hold for the rule to match; evaluation of
//! a rule stops at its first failing condition. Unknown condition kinds,
//! operators and predicates are logged and never match.

pub mod fields;
pub mod predicates;

use crate::message::MessageContext;
use anyhow::Context;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub use predicates::Predicate;

/// Value carried by a condition, and the shape a resolved field takes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl ConditionValue {
    pub fn as_text(&self) -> Option<String> {
        match self {
            ConditionValue::Text(s) => Some(s.clone()),
            ConditionValue::Number(n) => Some(n.to_string()),
            ConditionValue::Bool(b) => Some(b.to_string()),
            ConditionValue::List(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ConditionValue::Number(n) => Some(*n),
            ConditionValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionKind {
    Field,
    Pattern,
    Score,
    Custom,
    Unknown(String),
}

impl From<String> for ConditionKind {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "field" => ConditionKind::Field,
            "pattern" => ConditionKind::Pattern,
            "score" => ConditionKind::Score,
            "custom" => ConditionKind::Custom,
            _ => ConditionKind::Unknown(value),
        }
    }
}

impl From<ConditionKind> for String {
    fn from(kind: ConditionKind) -> Self {
        match kind {
            ConditionKind::Field => "field".to_string(),
            ConditionKind::Pattern => "pattern".to_string(),
            ConditionKind::Score => "score".to_string(),
            ConditionKind::Custom => "custom".to_string(),
            ConditionKind::Unknown(name) => name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    Gt,
    Lt,
    Gte,
    Lte,
    Matches,
    In,
    Unknown(String),
}

impl From<String> for Operator {
    fn from(value: String) -> Self {
        match value.as_str() {
            "equals" => Operator::Equals,
            "notEquals" => Operator::NotEquals,
            "contains" => Operator::Contains,
            "startsWith" => Operator::StartsWith,
            "endsWith" => Operator::EndsWith,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "gte" => Operator::Gte,
            "lte" => Operator::Lte,
            "matches" => Operator::Matches,
            "in" => Operator::In,
            _ => Operator::Unknown(value),
        }
    }
}

impl From<Operator> for String {
    fn from(operator: Operator) -> Self {
        let name = match operator {
            Operator::Equals => "equals",
            Operator::NotEquals => "notEquals",
            Operator::Contains => "contains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Matches => "matches",
            Operator::In => "in",
            Operator::Unknown(name) => return name,
        };
        name.to_string()
    }
}

/// One test against the message context. For `custom` conditions `field`
/// names the predicate and `value` is passed to it as the argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConditionValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negate: bool,
}

impl Condition {
    pub fn field(path: &str, operator: Operator, value: ConditionValue) -> Self {
        Self {
            kind: ConditionKind::Field,
            field: path.to_string(),
            operator,
            value: Some(value),
            negate: false,
        }
    }

    pub fn pattern(path: &str, pattern: &str) -> Self {
        Self {
            kind: ConditionKind::Pattern,
            field: path.to_string(),
            operator: Operator::Matches,
            value: Some(ConditionValue::Text(pattern.to_string())),
            negate: false,
        }
    }

    pub fn score(name: &str, operator: Operator, threshold: f64) -> Self {
        Self {
            kind: ConditionKind::Score,
            field: name.to_string(),
            operator,
            value: Some(ConditionValue::Number(threshold)),
            negate: false,
        }
    }

    pub fn custom(predicate: &str, argument: Option<ConditionValue>) -> Self {
        Self {
            kind: ConditionKind::Custom,
            field: predicate.to_string(),
            operator: Operator::Equals,
            value: argument,
            negate: false,
        }
    }

    fn uses_regex(&self) -> bool {
        self.kind == ConditionKind::Pattern
            || (self.kind == ConditionKind::Field && self.operator == Operator::Matches)
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleAction {
    Tag { tag: String },
    AdjustScore { delta: f64 },
    ReportThreat { description: String, severity: String },
    Quarantine,
    Reject { message: String },
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Rule {
    pub fn new(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            conditions: Vec::new(),
            actions: Vec::new(),
            priority,
            enabled: true,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatch {
    pub rule_name: String,
    pub priority: i32,
    pub actions: Vec<RuleAction>,
}

pub struct RuleEngine {
    rules: Vec<Rule>,
    predicates: HashMap<String, Box<dyn Predicate>>,
    compiled_patterns: HashMap<String, Regex>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Engine with the default predicates registered.
    pub fn new() -> Self {
        let mut engine = Self {
            rules: Vec::new(),
            predicates: HashMap::new(),
            compiled_patterns: HashMap::new(),
        };
        predicates::register_defaults(&mut engine);
        engine
    }

    pub fn register_predicate(&mut self, name: &str, predicate: Box<dyn Predicate>) {
        if self.predicates.insert(name.to_string(), predicate).is_some() {
            log::debug!("Replaced predicate '{name}'");
        }
    }

    pub fn has_predicate(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    /// Insert `rule` at its priority position. A rule with the same name is replaced.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.retain(|r| r.name != rule.name);
        self.prune_patterns();
        self.compile_patterns(&rule);
        let position = self.rules.partition_point(|r| r.priority >= rule.priority);
        log::debug!(
            "Adding rule '{}' (priority {}) at position {position}",
            rule.name,
            rule.priority
        );
        self.rules.insert(position, rule);
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        self.prune_patterns();
        before != self.rules.len()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn clear(&mut self) {
        self.rules.clear();
        self.compiled_patterns.clear();
    }

    /// Drop compiled regexes no remaining rule refers to.
    fn prune_patterns(&mut self) {
        let in_use: HashSet<String> = self
            .rules
            .iter()
            .flat_map(|r| r.conditions.iter())
            .filter(|c| c.uses_regex())
            .filter_map(|c| c.value.as_ref().and_then(ConditionValue::as_text))
            .collect();
        self.compiled_patterns.retain(|pattern, _| in_use.contains(pattern));
    }

    fn compile_patterns(&mut self, rule: &Rule) {
        for condition in &rule.conditions {
            if !condition.uses_regex() {
                continue;
            }
            let Some(pattern) = condition.value.as_ref().and_then(ConditionValue::as_text) else {
                log::warn!("Rule '{}': pattern condition without a pattern", rule.name);
                continue;
            };
            if self.compiled_patterns.contains_key(&pattern) {
                continue;
            }
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(regex) => {
                    self.compiled_patterns.insert(pattern, regex);
                }
                Err(e) => log::warn!("Rule '{}': invalid regex pattern '{pattern}': {e}", rule.name),
            }
        }
    }

    /// Matching enabled rules in priority order.
    pub fn evaluate(&self, ctx: &MessageContext) -> Vec<RuleMatch> {
        let matches: Vec<RuleMatch> = self
            .rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| rule.conditions.iter().all(|c| self.check(&rule.name, c, ctx)))
            .map(|rule| {
                log::debug!("Rule '{}' matched", rule.name);
                RuleMatch {
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                    actions: rule.actions.clone(),
                }
            })
            .collect();
        if !matches.is_empty() {
            log::info!("{} of {} rules matched", matches.len(), self.rules.len());
        }
        matches
    }

    fn check(&self, rule: &str, condition: &Condition, ctx: &MessageContext) -> bool {
        let result = self.condition_holds(rule, condition, ctx);
        if condition.negate {
            !result
        } else {
            result
        }
    }

    fn condition_holds(&self, rule: &str, condition: &Condition, ctx: &MessageContext) -> bool {
        match &condition.kind {
            ConditionKind::Field => {
                let Some(actual) = fields::resolve(ctx, &condition.field) else {
                    return false;
                };
                if condition.operator == Operator::Matches {
                    return self.regex_matches(condition, &actual);
                }
                let Some(expected) = &condition.value else {
                    log::warn!("Rule '{rule}': field condition on '{}' has no value", condition.field);
                    return false;
                };
                self.apply(rule, &condition.operator, &actual, expected)
            }
            ConditionKind::Pattern => match fields::resolve(ctx, &condition.field) {
                Some(actual) => self.regex_matches(condition, &actual),
                None => false,
            },
            ConditionKind::Score => {
                let name = condition
                    .field
                    .strip_prefix("scores.")
                    .unwrap_or(&condition.field);
                let Some(score) = ctx.scores.get(name) else {
                    return false;
                };
                let Some(expected) = &condition.value else {
                    log::warn!("Rule '{rule}': score condition on '{name}' has no threshold");
                    return false;
                };
                self.apply(rule, &condition.operator, &ConditionValue::Number(*score), expected)
            }
            ConditionKind::Custom => match self.predicates.get(&condition.field) {
                Some(predicate) => predicate.evaluate(ctx, condition.value.as_ref()),
                None => {
                    log::warn!("Rule '{rule}': unknown predicate '{}'", condition.field);
                    false
                }
            },
            ConditionKind::Unknown(kind) => {
                log::warn!("Rule '{rule}': unknown condition kind '{kind}'");
                false
            }
        }
    }

    fn apply(&self, rule: &str, operator: &Operator, actual: &ConditionValue, expected: &ConditionValue) -> bool {
        if let Operator::Unknown(name) = operator {
            log::warn!("Rule '{rule}': unknown operator '{name}'");
            return false;
        }
        fields::compare(operator, actual, expected).unwrap_or_else(|| {
            log::debug!("Rule '{rule}': operator {operator:?} does not apply to {actual:?} and {expected:?}");
            false
        })
    }

    fn regex_matches(&self, condition: &Condition, actual: &ConditionValue) -> bool {
        let Some(regex) = condition
            .value
            .as_ref()
            .and_then(ConditionValue::as_text)
            .and_then(|p| self.compiled_patterns.get(&p))
        else {
            return false;
        };
        match actual {
            ConditionValue::List(items) => items.iter().any(|item| regex.is_match(item)),
            other => other.as_text().is_some_and(|text| regex.is_match(&text)),
        }
    }

    pub fn load_rules_from_str(&mut self, yaml: &str) -> crate::error::Result<usize> {
        let rules: Vec<Rule> = serde_yaml::from_str(yaml)?;
        let count = rules.len();
        for rule in rules {
            self.add_rule(rule);
        }
        Ok(count)
    }

    pub fn load_rules<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules file {}", path.display()))?;
        let count = self
            .load_rules_from_str(&content)
            .with_context(|| format!("Failed to parse rules file {}", path.display()))?;
        log::info!("Loaded {count} rules from {}", path.display());
        Ok(count)
    }

    pub fn save_rules<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(&self.rules)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write rules file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn context() -> MessageContext {
        let mut ctx = MessageContext {
            from: Some("billing@paypa1-secure.com".to_string()),
            subject: "URGENT: Verify your account".to_string(),
            body: "Click here to verify your password".to_string(),
            ..Default::default()
        };
        ctx.headers.insert("X-Mailer", "MassMailer 2.0");
        ctx.scores.insert("phishing".to_string(), 70.0);
        ctx.add_tag("bulk");
        ctx
    }

    fn subject_rule(name: &str, priority: i32) -> Rule {
        Rule::new(name, priority).when(Condition::field(
            "subject",
            Operator::Contains,
            ConditionValue::Text("verify".to_string()),
        ))
    }

    #[test]
    fn test_priority_order_independent_of_insertion() {
        let mut engine = RuleEngine::new();
        engine.add_rule(subject_rule("low", 1));
        engine.add_rule(subject_rule("high", 10));
        engine.add_rule(subject_rule("mid-a", 5));
        engine.add_rule(subject_rule("mid-b", 5));

        let names: Vec<String> = engine
            .evaluate(&context())
            .into_iter()
            .map(|m| m.rule_name)
            .collect();
        assert_eq!(names, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut engine = RuleEngine::new();
        engine.add_rule(subject_rule("r", 1));
        engine.add_rule(subject_rule("other", 5));
        engine.add_rule(subject_rule("r", 10));
        assert_eq!(engine.rules().len(), 2);
        assert_eq!(engine.rules()[0].name, "r");
        assert!(engine.remove_rule("r"));
        assert!(!engine.remove_rule("r"));
        assert_eq!(engine.rules().len(), 1);
    }

    #[test]
    fn test_pattern_cache_follows_rule_set() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule::new("promo", 1).when(Condition::pattern("subject", r"free\s+gift")));
        engine.add_rule(Rule::new("shared", 2).when(Condition::pattern("body", "unsubscribe")));
        assert_eq!(engine.compiled_patterns.len(), 2);

        engine.add_rule(Rule::new("promo", 1).when(Condition::pattern("subject", "limited offer")));
        assert_eq!(engine.compiled_patterns.len(), 2);
        assert!(engine.compiled_patterns.contains_key("limited offer"));
        assert!(!engine.compiled_patterns.contains_key(r"free\s+gift"));

        engine.remove_rule("shared");
        engine.remove_rule("promo");
        assert!(engine.compiled_patterns.is_empty());
    }

    #[test]
    fn test_disabled_rules_skipped() {
        let mut engine = RuleEngine::new();
        let mut rule = subject_rule("off", 1);
        rule.enabled = false;
        engine.add_rule(rule);
        assert!(engine.evaluate(&context()).is_empty());
    }

    struct Counting(Arc<AtomicUsize>);

    impl Predicate for Counting {
        fn evaluate(&self, _ctx: &MessageContext, _argument: Option<&ConditionValue>) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_conditions_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut engine = RuleEngine::new();
        engine.register_predicate("counting", Box::new(Counting(calls.clone())));

        engine.add_rule(
            Rule::new("stops-early", 1)
                .when(Condition::field(
                    "subject",
                    Operator::Equals,
                    ConditionValue::Text("nope".to_string()),
                ))
                .when(Condition::custom("counting", None)),
        );
        assert!(engine.evaluate(&context()).is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        engine.add_rule(Rule::new("runs", 1).when(Condition::custom("counting", None)));
        assert_eq!(engine.evaluate(&context()).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_negate() {
        let mut engine = RuleEngine::new();
        engine.add_rule(
            Rule::new("not-trusted", 1).when(
                Condition::field(
                    "from",
                    Operator::EndsWith,
                    ConditionValue::Text("@paypal.com".to_string()),
                )
                .negated(),
            ),
        );
        assert_eq!(engine.evaluate(&context()).len(), 1);
    }

    #[test]
    fn test_fail_closed_on_unknowns() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule::new("bad-op", 1).when(Condition::field(
            "subject",
            Operator::Unknown("fuzzy".to_string()),
            ConditionValue::Text("verify".to_string()),
        )));
        engine.add_rule(Rule::new("bad-predicate", 1).when(Condition::custom("no-such", None)));
        engine.add_rule(Rule::new("bad-kind", 1).when(Condition {
            kind: ConditionKind::Unknown("magic".to_string()),
            field: "subject".to_string(),
            operator: Operator::Equals,
            value: None,
            negate: false,
        }));
        engine.add_rule(Rule::new("bad-regex", 1).when(Condition::pattern("subject", "([unclosed")));
        assert!(engine.evaluate(&context()).is_empty());
    }

    #[test]
    fn test_pattern_score_and_header_fallback() {
        let mut engine = RuleEngine::new();
        engine.add_rule(
            Rule::new("lookalike", 3)
                .when(Condition::pattern("from", r"paypa[l1]-"))
                .when(Condition::score("phishing", Operator::Gte, 50.0))
                .when(Condition::field(
                    "x-mailer",
                    Operator::StartsWith,
                    ConditionValue::Text("massmailer".to_string()),
                ))
                .then(RuleAction::AdjustScore { delta: -20.0 }),
        );
        engine.add_rule(Rule::new("spam-score", 2).when(Condition::score("spam", Operator::Gt, 0.5)));

        let matches = engine.evaluate(&context());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_name, "lookalike");
        assert_eq!(matches[0].actions, vec![RuleAction::AdjustScore { delta: -20.0 }]);
    }

    #[test]
    fn test_default_predicates_registered() {
        let engine = RuleEngine::new();
        for name in ["has-attachments", "is-reply", "is-forwarded", "sender-in-list", "has-tag"] {
            assert!(engine.has_predicate(name), "missing {name}");
        }
    }

    #[test]
    fn test_load_rules_from_yaml() {
        let yaml = r#"
- name: tag-bulk
  priority: 5
  conditions:
    - kind: custom
      field: has-tag
      value: bulk
  actions:
    - type: Tag
      tag: newsletter
- name: block-lookalike
  priority: 20
  conditions:
    - kind: field
      field: from
      operator: matches
      value: "paypa1"
    - kind: score
      field: scores.phishing
      operator: gt
      value: 60
  actions:
    - type: Reject
      message: "Impersonation detected"
    - type: ReportThreat
      description: "Brand lookalike sender"
      severity: high
- name: odd
  priority: 1
  conditions:
    - kind: field
      field: subject
      operator: sortOf
      value: verify
"#;
        let mut engine = RuleEngine::new();
        assert_eq!(engine.load_rules_from_str(yaml).unwrap(), 3);
        assert_eq!(engine.rules()[0].name, "block-lookalike");

        let matches = engine.evaluate(&context());
        let names: Vec<&str> = matches.iter().map(|m| m.rule_name.as_str()).collect();
        assert_eq!(names, vec!["block-lookalike", "tag-bulk"]);
        assert_eq!(
            matches[1].actions,
            vec![RuleAction::Tag {
                tag: "newsletter".to_string()
            }]
        );

        let saved = serde_yaml::to_string(engine.rules()).unwrap();
        assert!(saved.contains("sortOf"));
        let mut reloaded = RuleEngine::new();
        reloaded.load_rules_from_str(&saved).unwrap();
        assert_eq!(reloaded.rules(), engine.rules());
    }
}
