use std::net::IpAddr;

use super::AuthorizationContext;

const DELIMITERS: &[char] = &['.', '-', '+', ',', '/', '_', '='];

/// Expand a domain-spec such as `%{ir}.%{v}._spf.%{d2}`.
pub fn expand(spec: &str, ctx: &AuthorizationContext, domain: &str) -> Result<String, String> {
    let mut out = String::with_capacity(spec.len());
    let mut chars = spec.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('_') => out.push(' '),
            Some('-') => out.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => body.push(ch),
                        None => return Err(format!("unterminated macro in '{spec}'")),
                    }
                }
                out.push_str(&expand_macro(&body, ctx, domain)?);
            }
            _ => return Err(format!("invalid macro in '{spec}'")),
        }
    }
    Ok(out)
}

fn expand_macro(body: &str, ctx: &AuthorizationContext, domain: &str) -> Result<String, String> {
    let mut chars = body.chars();
    let letter = chars.next().ok_or_else(|| "empty macro".to_string())?;
    let rest: String = chars.collect();

    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let mut transformers = &rest[digits.len()..];
    let reverse = transformers.starts_with(['r', 'R']);
    if reverse {
        transformers = &transformers[1..];
    }
    if let Some(bad) = transformers.chars().find(|c| !DELIMITERS.contains(c)) {
        return Err(format!("invalid macro delimiter '{bad}'"));
    }
    let delimiters: Vec<char> = if transformers.is_empty() {
        vec!['.']
    } else {
        transformers.chars().collect()
    };

    let value = match letter.to_ascii_lowercase() {
        's' => ctx.sender.clone(),
        'l' => ctx.sender_local_part().to_string(),
        'o' => ctx.sender_domain().to_string(),
        'd' => domain.to_string(),
        'i' => ip_macro_value(ctx.client),
        'p' => "unknown".to_string(),
        'v' => match ctx.client {
            IpAddr::V4(_) => "in-addr".to_string(),
            IpAddr::V6(_) => "ip6".to_string(),
        },
        'h' => ctx.helo.clone().unwrap_or_else(|| "unknown".to_string()),
        other => return Err(format!("unknown macro letter '{other}'")),
    };

    let mut parts: Vec<&str> = value.split(|c| delimiters.contains(&c)).collect();
    if reverse {
        parts.reverse();
    }
    if !digits.is_empty() {
        let keep: usize = digits
            .parse()
            .map_err(|_| format!("invalid macro digit count '{digits}'"))?;
        if keep == 0 {
            return Err("macro digit count must be positive".to_string());
        }
        if keep < parts.len() {
            parts = parts.split_off(parts.len() - keep);
        }
    }

    let expanded = parts.join(".");
    if letter.is_ascii_uppercase() {
        Ok(url_escape(&expanded))
    } else {
        Ok(expanded)
    }
}

fn ip_macro_value(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .flat_map(|byte| [byte >> 4, byte & 0x0f])
            .map(|nibble| format!("{nibble:x}"))
            .collect::<Vec<_>>()
            .join("."),
    }
}

fn url_escape(value: &str) -> String {
    value
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(client: &str) -> AuthorizationContext {
        AuthorizationContext::new(
            client.parse().unwrap(),
            "email.example.com",
            "strong-bad@email.example.com",
            Some("mx.example.org"),
        )
    }

    #[test]
    fn test_expand_rfc_examples() {
        let ctx = context("192.0.2.3");
        let d = "email.example.com";
        assert_eq!(expand("%{s}", &ctx, d).unwrap(), "strong-bad@email.example.com");
        assert_eq!(expand("%{o}", &ctx, d).unwrap(), "email.example.com");
        assert_eq!(expand("%{d4}", &ctx, d).unwrap(), "email.example.com");
        assert_eq!(expand("%{d2}", &ctx, d).unwrap(), "example.com");
        assert_eq!(expand("%{d1}", &ctx, d).unwrap(), "com");
        assert_eq!(expand("%{dr}", &ctx, d).unwrap(), "com.example.email");
        assert_eq!(expand("%{d2r}", &ctx, d).unwrap(), "example.email");
        assert_eq!(expand("%{l}", &ctx, d).unwrap(), "strong-bad");
        assert_eq!(expand("%{l-}", &ctx, d).unwrap(), "strong.bad");
        assert_eq!(expand("%{lr-}", &ctx, d).unwrap(), "bad.strong");
        assert_eq!(expand("%{l1r-}", &ctx, d).unwrap(), "strong");
        assert_eq!(
            expand("%{ir}.%{v}._spf.%{d2}", &ctx, d).unwrap(),
            "3.2.0.192.in-addr._spf.example.com"
        );
        assert_eq!(expand("%{h}", &ctx, d).unwrap(), "mx.example.org");
        assert_eq!(expand("a%%b%_c%-d", &ctx, d).unwrap(), "a%b c%20d");
    }

    #[test]
    fn test_expand_ipv6_nibbles() {
        let ctx = context("2001:db8::cb01");
        let expanded = expand("%{ir}.%{v}._spf.%{d2}", &ctx, "email.example.com").unwrap();
        assert_eq!(
            expanded,
            "1.0.b.c.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6._spf.example.com"
        );
    }

    #[test]
    fn test_invalid_macros() {
        let ctx = context("192.0.2.3");
        assert!(expand("%{x}", &ctx, "example.com").is_err());
        assert!(expand("%{d0}", &ctx, "example.com").is_err());
        assert!(expand("%{d", &ctx, "example.com").is_err());
        assert!(expand("%a", &ctx, "example.com").is_err());
        assert!(expand("%{l!}", &ctx, "example.com").is_err());
    }
}
