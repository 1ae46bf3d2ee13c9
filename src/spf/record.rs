use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::SpfResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn from_prefix(c: char) -> Option<Self> {
        match c {
            '+' => Some(Qualifier::Pass),
            '-' => Some(Qualifier::Fail),
            '~' => Some(Qualifier::SoftFail),
            '?' => Some(Qualifier::Neutral),
            _ => None,
        }
    }

    pub fn result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Include(String),
    A {
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    Mx {
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    Ptr(Option<String>),
    Ip4 {
        addr: Ipv4Addr,
        prefix: u8,
    },
    Ip6 {
        addr: Ipv6Addr,
        prefix: u8,
    },
    Exists(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
    /// Term as written in the record, without qualifier.
    pub text: String,
}

/// A parsed policy record. Mechanisms keep record order; modifiers are
/// pulled out so they can be applied after the mechanism pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpfRecord {
    pub directives: Vec<Directive>,
    pub redirect: Option<String>,
    pub explanation: Option<String>,
}

pub fn is_spf_record(txt: &str) -> bool {
    let trimmed = txt.trim();
    let lower = trimmed.to_ascii_lowercase();
    lower == "v=spf1" || lower.starts_with("v=spf1 ")
}

pub fn parse_record(txt: &str) -> Result<SpfRecord, String> {
    if !is_spf_record(txt) {
        return Err("not an SPF record".to_string());
    }

    let mut record = SpfRecord::default();
    for term in txt.split_whitespace().skip(1) {
        if let Some((name, value)) = split_modifier(term) {
            match name.to_ascii_lowercase().as_str() {
                "redirect" => {
                    if record.redirect.replace(value.to_string()).is_some() {
                        return Err("duplicate redirect modifier".to_string());
                    }
                }
                "exp" => {
                    if record.explanation.replace(value.to_string()).is_some() {
                        return Err("duplicate exp modifier".to_string());
                    }
                }
                other => log::debug!("Ignoring unknown SPF modifier: {other}"),
            }
            continue;
        }
        record.directives.push(parse_directive(term)?);
    }
    Ok(record)
}

fn split_modifier(term: &str) -> Option<(&str, &str)> {
    let (name, value) = term.split_once('=')?;
    let mut chars = name.chars();
    let valid_name = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid_name {
        Some((name, value))
    } else {
        None
    }
}

fn parse_directive(term: &str) -> Result<Directive, String> {
    let (qualifier, rest) = match term.chars().next().and_then(Qualifier::from_prefix) {
        Some(q) => (q, &term[1..]),
        None => (Qualifier::Pass, term),
    };

    let name_end = rest.find([':', '/']).unwrap_or(rest.len());
    let name = rest[..name_end].to_ascii_lowercase();
    let tail = &rest[name_end..];

    let mechanism = match name.as_str() {
        "all" => {
            if !tail.is_empty() {
                return Err(format!("'all' takes no argument: {term}"));
            }
            Mechanism::All
        }
        "include" => Mechanism::Include(required_domain(tail, term)?),
        "exists" => Mechanism::Exists(required_domain(tail, term)?),
        "a" | "mx" => {
            let (domain, cidr4, cidr6) = parse_domain_and_cidr(tail, term)?;
            if name == "a" {
                Mechanism::A {
                    domain,
                    cidr4,
                    cidr6,
                }
            } else {
                Mechanism::Mx {
                    domain,
                    cidr4,
                    cidr6,
                }
            }
        }
        "ptr" => match tail.strip_prefix(':') {
            Some(domain) if !domain.is_empty() => Mechanism::Ptr(Some(domain.to_string())),
            Some(_) => return Err(format!("empty domain in {term}")),
            None if tail.is_empty() => Mechanism::Ptr(None),
            None => return Err(format!("malformed ptr mechanism: {term}")),
        },
        "ip4" => {
            let (addr, prefix) = parse_network(tail, term, 32)?;
            match addr {
                IpAddr::V4(addr) => Mechanism::Ip4 { addr, prefix },
                IpAddr::V6(_) => return Err(format!("ip4 with IPv6 address: {term}")),
            }
        }
        "ip6" => {
            let (addr, prefix) = parse_network(tail, term, 128)?;
            match addr {
                IpAddr::V6(addr) => Mechanism::Ip6 { addr, prefix },
                IpAddr::V4(_) => return Err(format!("ip6 with IPv4 address: {term}")),
            }
        }
        _ => return Err(format!("unknown mechanism: {term}")),
    };

    Ok(Directive {
        qualifier,
        mechanism,
        text: rest.to_string(),
    })
}

fn required_domain(tail: &str, term: &str) -> Result<String, String> {
    match tail.strip_prefix(':') {
        Some(domain) if !domain.is_empty() && !domain.contains('/') => Ok(domain.to_string()),
        _ => Err(format!("mechanism requires a domain: {term}")),
    }
}

fn parse_domain_and_cidr(tail: &str, term: &str) -> Result<(Option<String>, u8, u8), String> {
    let (domain, cidr) = match tail.strip_prefix(':') {
        Some(rest) => {
            let end = rest.find('/').unwrap_or(rest.len());
            if end == 0 {
                return Err(format!("empty domain in {term}"));
            }
            (Some(rest[..end].to_string()), &rest[end..])
        }
        None => (None, tail),
    };

    let (cidr4, cidr6) = if cidr.is_empty() {
        (32, 128)
    } else if let Some(v6) = cidr.strip_prefix("//") {
        (32, parse_prefix(v6, 128, term)?)
    } else if let Some(rest) = cidr.strip_prefix('/') {
        match rest.split_once("//") {
            Some((v4, v6)) => (parse_prefix(v4, 32, term)?, parse_prefix(v6, 128, term)?),
            None => (parse_prefix(rest, 32, term)?, 128),
        }
    } else {
        return Err(format!("malformed cidr in {term}"));
    };

    Ok((domain, cidr4, cidr6))
}

fn parse_network(tail: &str, term: &str, max_prefix: u8) -> Result<(IpAddr, u8), String> {
    let network = tail
        .strip_prefix(':')
        .ok_or_else(|| format!("missing address in {term}"))?;
    let (addr, prefix) = match network.split_once('/') {
        Some((addr, prefix)) => (addr, parse_prefix(prefix, max_prefix, term)?),
        None => (network, max_prefix),
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| format!("invalid address in {term}"))?;
    Ok((addr, prefix))
}

fn parse_prefix(value: &str, max: u8, term: &str) -> Result<u8, String> {
    if value.is_empty() || (value.starts_with('0') && value.len() > 1) {
        return Err(format!("malformed prefix length in {term}"));
    }
    match value.parse::<u8>() {
        Ok(prefix) if prefix <= max => Ok(prefix),
        _ => Err(format!("prefix length out of range in {term}")),
    }
}

pub fn network_contains(network: IpAddr, prefix: u8, candidate: IpAddr) -> bool {
    match (network, candidate) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_record() {
        let record =
            parse_record("v=spf1 +a mx:mail.example.com/24 ~ip4:192.0.2.0/24 ip6:2001:db8::/32 include:_spf.example.net redirect=other.example -all")
                .unwrap();
        assert_eq!(record.directives.len(), 6);
        assert_eq!(record.redirect.as_deref(), Some("other.example"));
        assert_eq!(
            record.directives[1].mechanism,
            Mechanism::Mx {
                domain: Some("mail.example.com".to_string()),
                cidr4: 24,
                cidr6: 128
            }
        );
        assert_eq!(record.directives[2].qualifier, Qualifier::SoftFail);
        assert_eq!(
            record.directives[3].mechanism,
            Mechanism::Ip6 {
                addr: "2001:db8::".parse().unwrap(),
                prefix: 32
            }
        );
        assert_eq!(record.directives[5].qualifier, Qualifier::Fail);
        assert_eq!(record.directives[5].text, "all");
    }

    #[test]
    fn test_dual_cidr() {
        let record = parse_record("v=spf1 a//64 a:host.example/28//96").unwrap();
        assert_eq!(
            record.directives[0].mechanism,
            Mechanism::A {
                domain: None,
                cidr4: 32,
                cidr6: 64
            }
        );
        assert_eq!(
            record.directives[1].mechanism,
            Mechanism::A {
                domain: Some("host.example".to_string()),
                cidr4: 28,
                cidr6: 96
            }
        );
    }

    #[test]
    fn test_malformed_records() {
        assert!(parse_record("v=spf1 foo:bar -all").is_err());
        assert!(parse_record("v=spf1 ip4:999.1.1.1").is_err());
        assert!(parse_record("v=spf1 ip4:10.0.0.0/33").is_err());
        assert!(parse_record("v=spf1 include").is_err());
        assert!(parse_record("v=spf1 all:foo").is_err());
        assert!(parse_record("v=spf1 redirect=a.example redirect=b.example").is_err());
        assert!(parse_record("v=spf10 -all").is_err());
    }

    #[test]
    fn test_is_spf_record() {
        assert!(is_spf_record("v=spf1 -all"));
        assert!(is_spf_record("V=SPF1"));
        assert!(!is_spf_record("google-site-verification=abc"));
        assert!(!is_spf_record("v=spf1x"));
    }

    #[test]
    fn test_network_contains() {
        let net: IpAddr = "192.0.2.0".parse().unwrap();
        assert!(network_contains(net, 24, "192.0.2.200".parse().unwrap()));
        assert!(!network_contains(net, 24, "192.0.3.1".parse().unwrap()));
        assert!(network_contains(net, 0, "8.8.8.8".parse().unwrap()));
        let net6: IpAddr = "2001:db8::".parse().unwrap();
        assert!(network_contains(net6, 32, "2001:db8:1::5".parse().unwrap()));
        assert!(!network_contains(net6, 32, "192.0.2.1".parse().unwrap()));
    }
}
