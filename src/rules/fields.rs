use super::{ConditionValue, Operator};
use crate::message::MessageContext;

const FLOAT_EPSILON: f64 = 1e-9;

/// Resolve a dot-separated path against the context. Paths that name no
/// known field fall back to the first value of the header with that name.
pub fn resolve(ctx: &MessageContext, path: &str) -> Option<ConditionValue> {
    let lower = path.trim().to_ascii_lowercase();
    let (head, rest) = match lower.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (lower.as_str(), None),
    };

    match (head, rest) {
        ("from", None) => text(ctx.from.as_deref()),
        ("from_header", None) => text(ctx.from_header.as_deref()),
        ("envelope_from", None) => text(ctx.envelope_from.as_deref()),
        ("sender", None) => text(ctx.sender_address()),
        ("sender_domain", None) => ctx.sender_domain().map(ConditionValue::Text),
        ("reply_to", None) => text(ctx.reply_to.as_deref()),
        ("to", None) => Some(ConditionValue::List(ctx.to.clone())),
        ("subject", None) => Some(ConditionValue::Text(ctx.subject.clone())),
        ("body", None) => Some(ConditionValue::Text(ctx.body.clone())),
        ("client_ip", None) => text(ctx.client_ip.as_deref()),
        ("helo", None) => text(ctx.helo.as_deref()),
        ("tags", None) => Some(ConditionValue::List(ctx.tags.clone())),
        ("links", None) => Some(ConditionValue::List(ctx.links.clone())),
        ("attachments", None) => Some(ConditionValue::List(ctx.attachments.clone())),
        ("scores", Some(name)) => ctx.scores.get(name).map(|s| ConditionValue::Number(*s)),
        ("metadata", Some(rest)) => {
            let mut segments = rest.split('.');
            let first = segments.next()?;
            let mut value = ctx.metadata.get(first)?;
            for segment in segments {
                value = value.get(segment)?;
            }
            json_value(value)
        }
        ("headers", Some(name)) => text(ctx.headers.get_first(name)),
        _ => text(ctx.headers.get_first(&lower)),
    }
}

fn text(value: Option<&str>) -> Option<ConditionValue> {
    value.map(|v| ConditionValue::Text(v.to_string()))
}

fn json_value(value: &serde_json::Value) -> Option<ConditionValue> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(ConditionValue::Bool(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(ConditionValue::Number),
        serde_json::Value::String(s) => Some(ConditionValue::Text(s.clone())),
        serde_json::Value::Array(items) => Some(ConditionValue::List(
            items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        )),
        serde_json::Value::Object(_) => Some(ConditionValue::Text(value.to_string())),
    }
}

/// Apply a comparison operator. `None` means the operator does not apply
/// to these value types; callers treat that as not matched.
pub fn compare(operator: &Operator, actual: &ConditionValue, expected: &ConditionValue) -> Option<bool> {
    match operator {
        Operator::Equals => Some(equals(actual, expected)),
        Operator::NotEquals => Some(!equals(actual, expected)),
        Operator::Contains => match (actual, expected) {
            (ConditionValue::List(items), _) => {
                let needle = expected.as_text()?;
                Some(items.iter().any(|item| item.eq_ignore_ascii_case(&needle)))
            }
            _ => {
                let haystack = actual.as_text()?.to_lowercase();
                Some(haystack.contains(&expected.as_text()?.to_lowercase()))
            }
        },
        Operator::StartsWith => text_test(actual, expected, |a, e| a.starts_with(e)),
        Operator::EndsWith => text_test(actual, expected, |a, e| a.ends_with(e)),
        Operator::Gt => numeric(actual, expected).map(|(a, e)| a > e),
        Operator::Lt => numeric(actual, expected).map(|(a, e)| a < e),
        Operator::Gte => numeric(actual, expected).map(|(a, e)| a >= e),
        Operator::Lte => numeric(actual, expected).map(|(a, e)| a <= e),
        Operator::In => match expected {
            ConditionValue::List(options) => {
                let candidates = match actual {
                    ConditionValue::List(items) => items.clone(),
                    other => vec![other.as_text()?],
                };
                Some(candidates.iter().any(|c| options.iter().any(|o| o.eq_ignore_ascii_case(c))))
            }
            _ => None,
        },
        // Regex operators are applied by the engine, which owns the compiled patterns.
        Operator::Matches | Operator::Unknown(_) => None,
    }
}

fn equals(actual: &ConditionValue, expected: &ConditionValue) -> bool {
    match (actual, expected) {
        (ConditionValue::Bool(a), ConditionValue::Bool(e)) => a == e,
        (ConditionValue::List(items), ConditionValue::List(options)) => {
            items.len() == options.len()
                && items
                    .iter()
                    .zip(options)
                    .all(|(a, e)| a.eq_ignore_ascii_case(e))
        }
        (ConditionValue::List(items), other) => other
            .as_text()
            .is_some_and(|e| items.iter().any(|item| item.eq_ignore_ascii_case(&e))),
        _ => match numeric(actual, expected) {
            Some((a, e)) => (a - e).abs() < FLOAT_EPSILON,
            None => match (actual.as_text(), expected.as_text()) {
                (Some(a), Some(e)) => a.eq_ignore_ascii_case(&e),
                _ => false,
            },
        },
    }
}

fn text_test(actual: &ConditionValue, expected: &ConditionValue, test: fn(&str, &str) -> bool) -> Option<bool> {
    let needle = expected.as_text()?.to_lowercase();
    match actual {
        ConditionValue::List(items) => Some(items.iter().any(|item| test(&item.to_lowercase(), &needle))),
        other => Some(test(&other.as_text()?.to_lowercase(), &needle)),
    }
}

fn numeric(actual: &ConditionValue, expected: &ConditionValue) -> Option<(f64, f64)> {
    Some((actual.as_number()?, expected.as_number()?))
}
