//! DNS access used by the SPF evaluator and the blacklist checker.
//!
//! `HickoryLookup` talks to the system resolver; `StaticLookup` answers
//! from in-memory tables and is what offline evaluation and tests use.

use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// NXDOMAIN or an empty answer.
    #[error("no records found for {0}")]
    NotFound(String),
    #[error("temporary DNS failure for {name}: {reason}")]
    Transient { name: String, reason: String },
}

#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn txt(&self, name: &str) -> Result<Vec<String>, LookupError>;
    /// A and AAAA records combined.
    async fn ip(&self, name: &str) -> Result<Vec<IpAddr>, LookupError>;
    /// Exchange host names ordered by preference.
    async fn mx(&self, name: &str) -> Result<Vec<String>, LookupError>;
    async fn ptr(&self, addr: IpAddr) -> Result<Vec<String>, LookupError>;
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

fn fqdn(name: &str) -> String {
    format!("{}.", normalize_name(name))
}

pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryLookup {
    pub fn from_system_conf(timeout_seconds: u64) -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| anyhow::anyhow!("Failed to create DNS resolver: {e}"))?;
        Ok(Self {
            resolver,
            timeout: Duration::from_secs(timeout_seconds),
        })
    }

    fn classify(name: &str, error: ResolveError) -> LookupError {
        match error.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => LookupError::NotFound(name.to_string()),
            _ => LookupError::Transient {
                name: name.to_string(),
                reason: error.to_string(),
            },
        }
    }

    fn timed_out(&self, name: &str) -> LookupError {
        LookupError::Transient {
            name: name.to_string(),
            reason: format!("timed out after {:?}", self.timeout),
        }
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        log::debug!("TXT lookup for {name}");
        let lookup = tokio::time::timeout(self.timeout, self.resolver.txt_lookup(fqdn(name)))
            .await
            .map_err(|_| self.timed_out(name))?
            .map_err(|e| Self::classify(name, e))?;

        let records: Vec<String> = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).to_string())
                    .collect::<String>()
            })
            .collect();
        if records.is_empty() {
            return Err(LookupError::NotFound(name.to_string()));
        }
        Ok(records)
    }

    async fn ip(&self, name: &str) -> Result<Vec<IpAddr>, LookupError> {
        log::debug!("A/AAAA lookup for {name}");
        let lookup = tokio::time::timeout(self.timeout, self.resolver.lookup_ip(fqdn(name)))
            .await
            .map_err(|_| self.timed_out(name))?
            .map_err(|e| Self::classify(name, e))?;

        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(LookupError::NotFound(name.to_string()));
        }
        Ok(addrs)
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, LookupError> {
        log::debug!("MX lookup for {name}");
        let lookup = tokio::time::timeout(self.timeout, self.resolver.mx_lookup(fqdn(name)))
            .await
            .map_err(|_| self.timed_out(name))?
            .map_err(|e| Self::classify(name, e))?;

        let mut exchanges: Vec<(u16, String)> = lookup
            .iter()
            .map(|mx| (mx.preference(), normalize_name(&mx.exchange().to_string())))
            .collect();
        if exchanges.is_empty() {
            return Err(LookupError::NotFound(name.to_string()));
        }
        exchanges.sort_by_key(|(preference, _)| *preference);
        Ok(exchanges.into_iter().map(|(_, host)| host).collect())
    }

    async fn ptr(&self, addr: IpAddr) -> Result<Vec<String>, LookupError> {
        let name = addr.to_string();
        log::debug!("PTR lookup for {name}");
        let lookup = tokio::time::timeout(self.timeout, self.resolver.reverse_lookup(addr))
            .await
            .map_err(|_| self.timed_out(&name))?
            .map_err(|e| Self::classify(&name, e))?;

        let names: Vec<String> = lookup
            .iter()
            .map(|ptr| normalize_name(&ptr.to_string()))
            .collect();
        if names.is_empty() {
            return Err(LookupError::NotFound(name));
        }
        Ok(names)
    }
}

/// In-memory resolver. Names listed via `fail` answer with a transient
/// error; every query is counted.
#[derive(Debug, Default)]
pub struct StaticLookup {
    txt: HashMap<String, Vec<String>>,
    ip: HashMap<String, Vec<IpAddr>>,
    mx: HashMap<String, Vec<String>>,
    ptr: HashMap<IpAddr, Vec<String>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    queries: AtomicUsize,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_txt(mut self, name: &str, record: &str) -> Self {
        self.txt
            .entry(normalize_name(name))
            .or_default()
            .push(record.to_string());
        self
    }

    pub fn with_ip(mut self, name: &str, addr: IpAddr) -> Self {
        self.ip.entry(normalize_name(name)).or_default().push(addr);
        self
    }

    pub fn with_mx(mut self, name: &str, exchange: &str) -> Self {
        self.mx
            .entry(normalize_name(name))
            .or_default()
            .push(normalize_name(exchange));
        self
    }

    pub fn with_ptr(mut self, addr: IpAddr, name: &str) -> Self {
        self.ptr.entry(addr).or_default().push(normalize_name(name));
        self
    }

    pub fn fail(mut self, name: &str) -> Self {
        self.failing.insert(normalize_name(name));
        self
    }

    /// Every answer is delayed, for exercising deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn answer<T: Clone + Send + Sync>(
        &self,
        name: &str,
        table: &HashMap<String, Vec<T>>,
    ) -> Result<Vec<T>, LookupError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let key = normalize_name(name);
        if self.failing.contains(&key) {
            return Err(LookupError::Transient {
                name: key,
                reason: "simulated failure".to_string(),
            });
        }
        match table.get(&key) {
            Some(values) if !values.is_empty() => Ok(values.clone()),
            _ => Err(LookupError::NotFound(key)),
        }
    }
}

#[async_trait]
impl DnsLookup for StaticLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        self.answer(name, &self.txt).await
    }

    async fn ip(&self, name: &str) -> Result<Vec<IpAddr>, LookupError> {
        self.answer(name, &self.ip).await
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, LookupError> {
        self.answer(name, &self.mx).await
    }

    async fn ptr(&self, addr: IpAddr) -> Result<Vec<String>, LookupError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.ptr.get(&addr) {
            Some(names) if !names.is_empty() => Ok(names.clone()),
            _ => Err(LookupError::NotFound(addr.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_lookup_answers() {
        let dns = StaticLookup::new()
            .with_txt("Example.com.", "v=spf1 -all")
            .with_ip("mail.example.com", "192.0.2.10".parse().unwrap())
            .fail("broken.example");

        assert_eq!(dns.txt("example.com").await.unwrap(), vec!["v=spf1 -all"]);
        assert_eq!(
            dns.ip("MAIL.example.com").await.unwrap(),
            vec!["192.0.2.10".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(
            dns.txt("missing.example").await,
            Err(LookupError::NotFound("missing.example".to_string()))
        );
        assert!(matches!(
            dns.txt("broken.example").await,
            Err(LookupError::Transient { .. })
        ));
        assert_eq!(dns.query_count(), 4);
    }
}
