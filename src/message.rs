use crate::error::{Result, SentinelError};
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

const MAX_MIME_DEPTH: usize = 4;

fn link_regex() -> &'static Regex {
    static LINK: OnceLock<Regex> = OnceLock::new();
    LINK.get_or_init(|| {
        Regex::new(r#"(?i)\bhttps?://[^\s<>"'()\[\]]+"#).expect("link pattern is valid")
    })
}

fn angle_address_regex() -> &'static Regex {
    static ANGLE: OnceLock<Regex> = OnceLock::new();
    ANGLE.get_or_init(|| Regex::new(r"<([^<>@\s]+@[^<>\s]+)>").expect("angle pattern is valid"))
}

fn bare_address_regex() -> &'static Regex {
    static BARE: OnceLock<Regex> = OnceLock::new();
    BARE.get_or_init(|| {
        Regex::new(r"([a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,})")
            .expect("address pattern is valid")
    })
}

/// Case-insensitive header multimap. Names are stored lower-cased and
/// values keep their arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: HashMap<String, Vec<String>>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.trim().to_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A message as handed to the coordinator, before parsing.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub raw: String,
    pub client_ip: Option<String>,
    pub helo: Option<String>,
    pub envelope_from: Option<String>,
}

impl InboundMessage {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Default::default()
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_helo(mut self, helo: impl Into<String>) -> Self {
        self.helo = Some(helo.into());
        self
    }

    pub fn with_envelope_from(mut self, sender: impl Into<String>) -> Self {
        self.envelope_from = Some(sender.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub headers: HeaderMap,
    pub body: String,
}

/// Flattened view of one message, shared by the rule engine and the
/// coordinator. Analyzers attach `scores`, `tags` and `metadata` to it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageContext {
    pub from: Option<String>,
    pub from_header: Option<String>,
    pub envelope_from: Option<String>,
    pub reply_to: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub headers: HeaderMap,
    pub client_ip: Option<String>,
    pub helo: Option<String>,
    pub links: Vec<String>,
    pub attachments: Vec<String>,
    pub scores: HashMap<String, f64>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MessageContext {
    pub fn from_inbound(message: &InboundMessage) -> Result<Self> {
        let parsed = parse_message(&message.raw)?;
        let headers = parsed.headers;

        let mut text_parts = Vec::new();
        let mut attachments = Vec::new();
        collect_parts(&headers, &parsed.body, 0, &mut text_parts, &mut attachments);
        let body = text_parts.join("\n");

        let from_header = headers.get_first("from").map(str::to_string);
        let from = from_header.as_deref().and_then(extract_email_address);
        let reply_to = headers
            .get_first("reply-to")
            .and_then(extract_email_address);

        let mut to = Vec::new();
        for name in ["to", "cc"] {
            for value in headers.get_all(name) {
                to.extend(extract_address_list(value));
            }
        }

        let envelope_from = message
            .envelope_from
            .clone()
            .or_else(|| headers.get_first("return-path").and_then(extract_email_address));

        let mut context = MessageContext {
            from,
            from_header,
            envelope_from,
            reply_to,
            to,
            subject: headers.get_first("subject").unwrap_or_default().to_string(),
            links: extract_links(&body),
            body,
            client_ip: message.client_ip.clone(),
            helo: message.helo.clone(),
            attachments,
            headers,
            ..Default::default()
        };
        context.metadata.insert(
            "attachment_count".to_string(),
            serde_json::Value::from(context.attachments.len()),
        );
        context.metadata.insert(
            "link_count".to_string(),
            serde_json::Value::from(context.links.len()),
        );

        log::debug!(
            "Built message context: from={:?} subject={:?} links={} attachments={}",
            context.from,
            context.subject,
            context.links.len(),
            context.attachments.len()
        );
        Ok(context)
    }

    /// Envelope sender if known, otherwise the From address.
    pub fn sender_address(&self) -> Option<&str> {
        self.envelope_from.as_deref().or(self.from.as_deref())
    }

    pub fn sender_domain(&self) -> Option<String> {
        self.sender_address().and_then(extract_domain)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn add_tag(&mut self, tag: &str) {
        if !self.has_tag(tag) {
            self.tags.push(tag.to_string());
        }
    }
}

/// Split a raw RFC 5322 message into an unfolded header multimap and a body.
pub fn parse_message(raw: &str) -> Result<ParsedMessage> {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.trim().is_empty() {
        return Err(SentinelError::Parse("empty message".to_string()));
    }

    let (header_section, body) = match normalized.split_once("\n\n") {
        Some((headers, body)) => (headers, body.to_string()),
        None => (normalized.as_str(), String::new()),
    };

    let headers = parse_headers(header_section)?;
    if headers.is_empty() {
        return Err(SentinelError::Parse("missing header section".to_string()));
    }

    Ok(ParsedMessage { headers, body })
}

fn parse_headers(section: &str) -> Result<HeaderMap> {
    let mut unfolded: Vec<(String, String)> = Vec::new();

    for line in section.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            match unfolded.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => {
                    return Err(SentinelError::Parse(
                        "continuation line before first header".to_string(),
                    ))
                }
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SentinelError::Parse(format!("invalid header line: {line}")))?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_graphic()) {
            return Err(SentinelError::Parse(format!("invalid header name: {name}")));
        }
        unfolded.push((name.to_string(), value.trim().to_string()));
    }

    let mut headers = HeaderMap::new();
    for (name, value) in unfolded {
        headers.insert(&name, value);
    }
    Ok(headers)
}

/// Walk MIME parts, collecting decoded text and attachment names.
fn collect_parts(
    headers: &HeaderMap,
    body: &str,
    depth: usize,
    text_parts: &mut Vec<String>,
    attachments: &mut Vec<String>,
) {
    let content_type = headers
        .get_first("content-type")
        .unwrap_or("text/plain")
        .to_lowercase();
    let disposition = headers
        .get_first("content-disposition")
        .unwrap_or_default()
        .to_lowercase();

    if disposition.starts_with("attachment") || header_param(&disposition, "filename").is_some()
    {
        let name = headers
            .get_first("content-disposition")
            .and_then(|d| header_param(d, "filename"))
            .or_else(|| headers.get_first("content-type").and_then(|c| header_param(c, "name")))
            .unwrap_or_else(|| "unnamed".to_string());
        attachments.push(name);
        return;
    }

    if content_type.starts_with("multipart/") && depth < MAX_MIME_DEPTH {
        let boundary = headers
            .get_first("content-type")
            .and_then(|c| header_param(c, "boundary"));
        if let Some(boundary) = boundary {
            for part in split_multipart(body, &boundary) {
                match parse_message(part) {
                    Ok(parsed) => collect_parts(
                        &parsed.headers,
                        &parsed.body,
                        depth + 1,
                        text_parts,
                        attachments,
                    ),
                    // A part without headers is plain text per RFC 2046.
                    Err(_) => text_parts.push(part.trim().to_string()),
                }
            }
            return;
        }
    }

    if content_type.starts_with("text/") || content_type.is_empty() {
        let encoding = headers
            .get_first("content-transfer-encoding")
            .unwrap_or_default()
            .to_lowercase();
        text_parts.push(decode_body(body, &encoding));
    }
}

fn split_multipart<'a>(body: &'a str, boundary: &str) -> Vec<&'a str> {
    let delimiter = format!("--{boundary}");
    let closing = format!("--{boundary}--");
    let mut parts = Vec::new();

    let before_close = body.split(closing.as_str()).next().unwrap_or(body);
    for (i, chunk) in before_close.split(delimiter.as_str()).enumerate() {
        // The chunk ahead of the first delimiter is the preamble.
        if i == 0 {
            continue;
        }
        let chunk = chunk.strip_prefix('\n').unwrap_or(chunk);
        if !chunk.trim().is_empty() {
            parts.push(chunk);
        }
    }
    parts
}

fn header_param(value: &str, param: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|piece| {
        let (key, val) = piece.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(param) {
            Some(val.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn decode_body(body: &str, encoding: &str) -> String {
    match encoding {
        "base64" => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            match general_purpose::STANDARD.decode(compact.as_bytes()) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                Err(e) => {
                    log::debug!("Base64 body did not decode, keeping raw text: {e}");
                    body.to_string()
                }
            }
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.to_string(),
    }
}

fn decode_quoted_printable(body: &str) -> String {
    let joined = body.replace("=\n", "");
    let bytes = joined.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// `"Jane <jane@example.com>"` or a bare address.
pub fn extract_email_address(header_value: &str) -> Option<String> {
    if let Some(caps) = angle_address_regex().captures(header_value) {
        return caps.get(1).map(|m| m.as_str().to_lowercase());
    }
    bare_address_regex()
        .captures(header_value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

fn extract_address_list(header_value: &str) -> Vec<String> {
    header_value
        .split(',')
        .filter_map(extract_email_address)
        .collect()
}

pub fn extract_domain(email: &str) -> Option<String> {
    let (local, domain) = email.rsplit_once('@')?;
    if local.is_empty() {
        return None;
    }
    let domain = domain.trim().trim_end_matches('>').trim_end_matches('.');
    if domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(domain.to_lowercase())
}

/// Unique `http(s)` links in first-seen order.
pub fn extract_links(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    link_regex()
        .find_iter(body)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string())
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

pub fn link_domain(link: &str) -> Option<String> {
    url::Url::parse(link)
        .ok()?
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_message() {
        let raw = "From: test@example.com\r\nSubject: Test\r\n\r\nBody";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.headers.get_first("FROM"), Some("test@example.com"));
        assert_eq!(parsed.headers.get_first("subject"), Some("Test"));
        assert_eq!(parsed.body, "Body");
    }

    #[test]
    fn test_folded_and_repeated_headers() {
        let raw = "Received: from a.example.com\n\tby b.example.com\nReceived: from c.example.com\nSubject: hi\n\nbody";
        let parsed = parse_message(raw).unwrap();
        let received = parsed.headers.get_all("received");
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], "from a.example.com by b.example.com");
    }

    #[test]
    fn test_unparseable_messages() {
        assert!(parse_message("").is_err());
        assert!(parse_message("   \n  ").is_err());
        assert!(parse_message("this is not an email at all").is_err());
        assert!(parse_message(" leading continuation\nSubject: x\n\n").is_err());
    }

    #[test]
    fn test_context_from_inbound() {
        let raw = "From: \"Pay Pal\" <Service@Example.com>\n\
                   To: a@one.com, B <b@two.com>\n\
                   Reply-To: other@free-mail.com\n\
                   Subject: Account notice\n\
                   \n\
                   Visit https://example.com/login. Or http://1.2.3.4/x\n";
        let inbound = InboundMessage::new(raw).with_client_ip("192.0.2.1");
        let context = MessageContext::from_inbound(&inbound).unwrap();

        assert_eq!(context.from.as_deref(), Some("service@example.com"));
        assert_eq!(context.to, vec!["a@one.com", "b@two.com"]);
        assert_eq!(context.reply_to.as_deref(), Some("other@free-mail.com"));
        assert_eq!(context.subject, "Account notice");
        assert_eq!(
            context.links,
            vec!["https://example.com/login", "http://1.2.3.4/x"]
        );
        assert_eq!(context.sender_domain().as_deref(), Some("example.com"));
        assert_eq!(context.client_ip.as_deref(), Some("192.0.2.1"));
    }

    #[test]
    fn test_multipart_with_attachment() {
        let raw = "From: a@example.com\n\
                   Subject: invoice\n\
                   Content-Type: multipart/mixed; boundary=\"XYZ\"\n\
                   \n\
                   preamble\n\
                   --XYZ\n\
                   Content-Type: text/plain\n\
                   Content-Transfer-Encoding: base64\n\
                   \n\
                   SGVsbG8gd29ybGQ=\n\
                   --XYZ\n\
                   Content-Type: application/pdf; name=\"invoice.pdf\"\n\
                   Content-Disposition: attachment; filename=\"invoice.pdf\"\n\
                   \n\
                   JVBERi0xLjQK\n\
                   --XYZ--\n";
        let context = MessageContext::from_inbound(&InboundMessage::new(raw)).unwrap();
        assert_eq!(context.body.trim(), "Hello world");
        assert_eq!(context.attachments, vec!["invoice.pdf"]);
        assert_eq!(context.metadata["attachment_count"], 1);
    }

    #[test]
    fn test_quoted_printable_body() {
        assert_eq!(decode_quoted_printable("caf=C3=A9 =\nbar"), "café bar");
    }

    #[test]
    fn test_address_and_domain_helpers() {
        assert_eq!(
            extract_email_address("John Doe <john@example.com>"),
            Some("john@example.com".to_string())
        );
        assert_eq!(
            extract_email_address("plain@example.org"),
            Some("plain@example.org".to_string())
        );
        assert_eq!(extract_email_address("no address here"), None);
        assert_eq!(extract_domain("user@Mail.Example.com"), Some("mail.example.com".to_string()));
        assert_eq!(extract_domain("@example.com"), None);
        assert_eq!(link_domain("https://www.Example.com/path"), Some("example.com".to_string()));
    }
}
