//! Adaptive spam classifier.
//!
//! Token counts are learned online with `train_spam`/`train_ham` and can be
//! reversed with `untrain`. Classification combines the most interesting
//! token probabilities in log-odds space.

pub mod tokenizer;

use crate::config::ClassifierConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub use tokenizer::tokenize;

const PROBABILITY_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TokenCounts {
    spam: u64,
    ham: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatistics {
    pub token: String,
    pub spam_count: u64,
    pub ham_count: u64,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenScore {
    pub token: String,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub spam_probability: f64,
    pub is_spam: bool,
    pub confidence: f64,
    pub top_spam_tokens: Vec<TokenScore>,
    pub top_ham_tokens: Vec<TokenScore>,
    pub tokens_considered: usize,
}

impl Classification {
    fn neutral() -> Self {
        Self {
            spam_probability: 0.5,
            is_spam: false,
            confidence: 0.0,
            top_spam_tokens: Vec::new(),
            top_ham_tokens: Vec::new(),
            tokens_considered: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub spam_count: u64,
    pub ham_count: u64,
}

/// Serializable classifier state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierSnapshot {
    pub tokens: Vec<TokenRecord>,
    pub total_spam_messages: u64,
    pub total_ham_messages: u64,
}

impl ClassifierSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub struct AdaptiveClassifier {
    config: ClassifierConfig,
    tokens: HashMap<String, TokenCounts>,
    total_spam: u64,
    total_ham: u64,
}

impl Default for AdaptiveClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl AdaptiveClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            tokens: HashMap::new(),
            total_spam: 0,
            total_ham: 0,
        }
    }

    pub fn train_spam(&mut self, subject: &str, body: &str, sender: &str) {
        self.train(subject, body, sender, true);
    }

    pub fn train_ham(&mut self, subject: &str, body: &str, sender: &str) {
        self.train(subject, body, sender, false);
    }

    fn train(&mut self, subject: &str, body: &str, sender: &str, spam: bool) {
        let tokens = tokenize(subject, body, sender);
        for token in &tokens {
            let counts = self.tokens.entry(token.clone()).or_default();
            if spam {
                counts.spam += 1;
            } else {
                counts.ham += 1;
            }
        }
        if spam {
            self.total_spam += 1;
        } else {
            self.total_ham += 1;
        }
        log::debug!(
            "Trained {} message with {} tokens ({} known tokens)",
            if spam { "spam" } else { "ham" },
            tokens.len(),
            self.tokens.len()
        );
    }

    /// Reverse an earlier `train_spam`/`train_ham` call made with the same input.
    pub fn untrain(&mut self, subject: &str, body: &str, was_spam: bool, sender: &str) {
        for token in tokenize(subject, body, sender) {
            let Some(counts) = self.tokens.get_mut(&token) else {
                continue;
            };
            if was_spam {
                counts.spam = counts.spam.saturating_sub(1);
            } else {
                counts.ham = counts.ham.saturating_sub(1);
            }
            if counts.spam == 0 && counts.ham == 0 {
                self.tokens.remove(&token);
            }
        }
        if was_spam {
            self.total_spam = self.total_spam.saturating_sub(1);
        } else {
            self.total_ham = self.total_ham.saturating_sub(1);
        }
    }

    pub fn classify(&self, subject: &str, body: &str, sender: &str) -> Classification {
        if self.total_spam + self.total_ham == 0 {
            return Classification::neutral();
        }
        let tokens = tokenize(subject, body, sender);
        if tokens.is_empty() {
            return Classification::neutral();
        }

        let mut scored = self.score_tokens(&tokens);
        scored.sort_by(|a, b| {
            let da = (a.probability - 0.5).abs();
            let db = (b.probability - 0.5).abs();
            db.total_cmp(&da).then_with(|| a.token.cmp(&b.token))
        });
        scored.truncate(self.config.interesting_tokens.max(1));

        let log_odds: f64 = scored
            .iter()
            .map(|t| (t.probability / (1.0 - t.probability)).ln())
            .sum();
        let spam_probability = (1.0 / (1.0 + (-log_odds).exp())).clamp(0.0, 1.0);

        let mut top_spam_tokens: Vec<TokenScore> = scored
            .iter()
            .filter(|t| t.probability > 0.5)
            .cloned()
            .collect();
        top_spam_tokens.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        let mut top_ham_tokens: Vec<TokenScore> = scored
            .iter()
            .filter(|t| t.probability < 0.5)
            .cloned()
            .collect();
        top_ham_tokens.sort_by(|a, b| a.probability.total_cmp(&b.probability));

        Classification {
            spam_probability,
            is_spam: spam_probability >= self.config.spam_threshold,
            confidence: ((spam_probability - 0.5).abs() * 2.0).min(1.0),
            top_spam_tokens,
            top_ham_tokens,
            tokens_considered: scored.len(),
        }
    }

    fn score_tokens(&self, tokens: &BTreeSet<String>) -> Vec<TokenScore> {
        tokens
            .iter()
            .map(|token| TokenScore {
                token: token.clone(),
                probability: match self.tokens.get(token) {
                    Some(counts) => self.probability(*counts),
                    None => self.bounded(self.config.unknown_token_probability),
                },
            })
            .collect()
    }

    fn probability(&self, counts: TokenCounts) -> f64 {
        let s = self.config.smoothing;
        let spam_rate = counts.spam as f64 / self.total_spam.max(1) as f64;
        let ham_rate = counts.ham as f64 / self.total_ham.max(1) as f64;
        let p = (spam_rate + s) / (spam_rate + ham_rate + 2.0 * s);
        self.bounded(p)
    }

    /// Clamp into the configured band, which itself stays strictly inside (0, 1)
    /// so every token has finite log-odds.
    fn bounded(&self, p: f64) -> f64 {
        if p.is_nan() {
            return 0.5;
        }
        let low = self.config.min_probability.max(PROBABILITY_FLOOR);
        let high = self
            .config
            .max_probability
            .min(1.0 - PROBABILITY_FLOOR)
            .max(low);
        p.clamp(low, high)
    }

    pub fn token_stats(&self, token: &str) -> Option<TokenStatistics> {
        self.tokens.get(token).map(|counts| TokenStatistics {
            token: token.to_string(),
            spam_count: counts.spam,
            ham_count: counts.ham,
            probability: self.probability(*counts),
        })
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn total_spam_messages(&self) -> u64 {
        self.total_spam
    }

    pub fn total_ham_messages(&self) -> u64 {
        self.total_ham
    }

    pub fn export_state(&self) -> ClassifierSnapshot {
        let mut tokens: Vec<TokenRecord> = self
            .tokens
            .iter()
            .map(|(token, counts)| TokenRecord {
                token: token.clone(),
                spam_count: counts.spam,
                ham_count: counts.ham,
            })
            .collect();
        tokens.sort_by(|a, b| a.token.cmp(&b.token));
        ClassifierSnapshot {
            tokens,
            total_spam_messages: self.total_spam,
            total_ham_messages: self.total_ham,
        }
    }

    /// Replace the current state with `snapshot`. Records with zero counts are dropped.
    pub fn import_state(&mut self, snapshot: ClassifierSnapshot) {
        self.tokens = snapshot
            .tokens
            .into_iter()
            .filter(|r| r.spam_count + r.ham_count > 0)
            .map(|r| {
                (
                    r.token,
                    TokenCounts {
                        spam: r.spam_count,
                        ham: r.ham_count,
                    },
                )
            })
            .collect();
        self.total_spam = snapshot.total_spam_messages;
        self.total_ham = snapshot.total_ham_messages;
        log::info!(
            "Imported classifier state: {} tokens, {} spam / {} ham messages",
            self.tokens.len(),
            self.total_spam,
            self.total_ham
        );
    }

    pub fn reset(&mut self) {
        self.tokens.clear();
        self.total_spam = 0;
        self.total_ham = 0;
    }
}
