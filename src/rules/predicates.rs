use super::{ConditionValue, RuleEngine};
use crate::message::{extract_domain, MessageContext};

/// A named check that `custom` conditions delegate to.
pub trait Predicate: Send + Sync {
    fn evaluate(&self, ctx: &MessageContext, argument: Option<&ConditionValue>) -> bool;
}

pub(super) fn register_defaults(engine: &mut RuleEngine) {
    engine.register_predicate("has-attachments", Box::new(HasAttachments));
    engine.register_predicate("is-reply", Box::new(IsReply));
    engine.register_predicate("is-forwarded", Box::new(IsForwarded));
    engine.register_predicate("sender-in-list", Box::new(SenderInList));
    engine.register_predicate("has-tag", Box::new(HasTag));
}

/// True when the message carries attachments. A numeric argument sets the
/// minimum count.
pub struct HasAttachments;

impl Predicate for HasAttachments {
    fn evaluate(&self, ctx: &MessageContext, argument: Option<&ConditionValue>) -> bool {
        let count = ctx
            .metadata
            .get("attachment_count")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(0)
            .max(ctx.attachments.len());
        let minimum = argument
            .and_then(ConditionValue::as_number)
            .map(|n| n.max(1.0) as usize)
            .unwrap_or(1);
        count >= minimum
    }
}

const REPLY_PREFIXES: &[&str] = &["re:", "aw:", "sv:", "antw:"];
const FORWARD_PREFIXES: &[&str] = &["fw:", "fwd:", "wg:", "tr:"];

fn subject_has_prefix(subject: &str, prefixes: &[&str]) -> bool {
    let lower = subject.trim_start().to_lowercase();
    prefixes.iter().any(|p| lower.starts_with(p))
}

pub struct IsReply;

impl Predicate for IsReply {
    fn evaluate(&self, ctx: &MessageContext, _argument: Option<&ConditionValue>) -> bool {
        ctx.headers.contains("in-reply-to") || subject_has_prefix(&ctx.subject, REPLY_PREFIXES)
    }
}

pub struct IsForwarded;

impl Predicate for IsForwarded {
    fn evaluate(&self, ctx: &MessageContext, _argument: Option<&ConditionValue>) -> bool {
        ctx.headers.contains("resent-from")
            || ctx.headers.contains("x-forwarded-for")
            || subject_has_prefix(&ctx.subject, FORWARD_PREFIXES)
    }
}

/// Argument is a list (or comma-separated text) of addresses and domains.
/// Bare domains and `@domain` entries also match subdomains.
pub struct SenderInList;

impl Predicate for SenderInList {
    fn evaluate(&self, ctx: &MessageContext, argument: Option<&ConditionValue>) -> bool {
        let entries: Vec<String> = match argument {
            Some(ConditionValue::List(items)) => items.clone(),
            Some(other) => other
                .as_text()
                .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            None => return false,
        };
        let Some(sender) = ctx.sender_address().map(str::to_lowercase) else {
            return false;
        };
        let domain = extract_domain(&sender);

        entries.iter().any(|entry| {
            let entry = entry.trim().to_lowercase();
            if entry.is_empty() {
                return false;
            }
            let domain_entry = match entry.strip_prefix('@') {
                Some(d) => d,
                None if !entry.contains('@') => entry.as_str(),
                None => return entry == sender,
            };
            domain
                .as_deref()
                .is_some_and(|d| d == domain_entry || d.ends_with(&format!(".{domain_entry}")))
        })
    }
}

pub struct HasTag;

impl Predicate for HasTag {
    fn evaluate(&self, ctx: &MessageContext, argument: Option<&ConditionValue>) -> bool {
        match argument {
            Some(ConditionValue::List(tags)) => tags.iter().any(|t| ctx.has_tag(t)),
            Some(other) => other.as_text().is_some_and(|t| ctx.has_tag(&t)),
            None => !ctx.tags.is_empty(),
        }
    }
}
