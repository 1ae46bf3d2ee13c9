use crate::message::{extract_domain, extract_links, link_domain};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

const MAX_URL_TOKEN_LEN: usize = 40;
const MIN_LETTERS_FOR_CAPS: usize = 20;
const CAPS_RATIO: f64 = 0.6;

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"\b[\p{L}\p{M}\p{N}]{3,50}\b").expect("word pattern is valid"))
}

fn punctuation_regex() -> &'static Regex {
    static PUNCT: OnceLock<Regex> = OnceLock::new();
    PUNCT.get_or_init(|| Regex::new(r"[!?]{3,}").expect("punctuation pattern is valid"))
}

fn currency_run_regex() -> &'static Regex {
    static CURRENCY: OnceLock<Regex> = OnceLock::new();
    CURRENCY.get_or_init(|| Regex::new(r"[$€£¥]{2,}").expect("currency pattern is valid"))
}

/// Unique tokens of one message, sorted so training and untraining see
/// the same set for the same input.
pub fn tokenize(subject: &str, body: &str, sender: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let text = format!("{subject}\n{body}");

    let lower = text.to_lowercase();
    for word in word_regex().find_iter(&lower) {
        tokens.insert(word.as_str().to_string());
    }

    let links = extract_links(body);
    for link in &links {
        let lower_link = link.to_lowercase();
        let stripped = lower_link
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let truncated: String = stripped.chars().take(MAX_URL_TOKEN_LEN).collect();
        tokens.insert(format!("url:{truncated}"));
        if let Some(host) = link_domain(link) {
            tokens.insert(format!("urlhost:{host}"));
        }
    }

    if let Some(domain) = extract_domain(sender) {
        if let Some(tld) = domain.rsplit('.').next() {
            tokens.insert(format!("sendertld:{tld}"));
        }
        tokens.insert(format!("sender:{domain}"));
    }

    if punctuation_regex().is_match(&text) {
        tokens.insert("style:excess_punctuation".to_string());
    }
    if currency_run_regex().is_match(&text) {
        tokens.insert("style:currency_run".to_string());
    }
    let mut plain = text.clone();
    for link in &links {
        plain = plain.replace(link.as_str(), " ");
    }
    if is_shouting(&plain) {
        tokens.insert("style:excess_caps".to_string());
    }
    let subject_letters = subject.chars().filter(|c| c.is_alphabetic()).count();
    if subject_letters >= 8 && !subject.chars().any(char::is_lowercase) {
        tokens.insert("style:caps_subject".to_string());
    }

    tokens
}

fn is_shouting(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < MIN_LETTERS_FOR_CAPS {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64 > CAPS_RATIO
}
