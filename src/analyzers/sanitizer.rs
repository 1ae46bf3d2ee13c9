use super::{ContentSanitizer, SanitizeOptions};
use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    script: Regex,
    style: Regex,
    comment: Regex,
    block_break: Regex,
    tag: Regex,
    link: Regex,
    spaces: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        script: Regex::new(r"(?is)<script\b.*?</script\s*>").expect("script pattern is valid"),
        style: Regex::new(r"(?is)<style\b.*?</style\s*>").expect("style pattern is valid"),
        comment: Regex::new(r"(?s)<!--.*?-->").expect("comment pattern is valid"),
        block_break: Regex::new(r"(?i)<\s*(br|/p|/div|/li|/tr|/h[1-6])\b[^>]*>")
            .expect("block pattern is valid"),
        tag: Regex::new(r"<[^>]*>").expect("tag pattern is valid"),
        link: Regex::new(r"(?i)\b(https?://|www\.)\S+").expect("link pattern is valid"),
        spaces: Regex::new(r"[ \t]+").expect("space pattern is valid"),
    })
}

/// Turns HTML into plain display text.
#[derive(Debug, Default)]
pub struct TagSanitizer;

impl TagSanitizer {
    pub fn new() -> Self {
        Self
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

impl ContentSanitizer for TagSanitizer {
    fn sanitize(&self, content: &str, options: &SanitizeOptions) -> String {
        let p = patterns();
        let mut text = content.to_string();

        if options.strip_tags {
            text = p.script.replace_all(&text, "").into_owned();
            text = p.style.replace_all(&text, "").into_owned();
            text = p.comment.replace_all(&text, "").into_owned();
            text = p.block_break.replace_all(&text, "\n").into_owned();
            text = p.tag.replace_all(&text, "").into_owned();
            text = decode_entities(&text);
        }
        if options.remove_links {
            text = p.link.replace_all(&text, "[link removed]").into_owned();
        }

        let lines: Vec<String> = text
            .lines()
            .map(|line| p.spaces.replace_all(line.trim(), " ").into_owned())
            .filter(|line| !line.is_empty())
            .collect();
        let mut cleaned = lines.join("\n");

        if let Some(max) = options.max_length {
            if let Some((index, _)) = cleaned.char_indices().nth(max) {
                cleaned.truncate(index);
            }
        }
        cleaned
    }
}
