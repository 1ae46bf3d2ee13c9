use super::{BlacklistChecker, BlacklistReport, Severity};
use crate::dns::{DnsLookup, LookupError};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// DNSBL client. Queries `<reversed-octets>.<zone>` for every configured zone.
pub struct DnsBlacklistChecker {
    dns: Arc<dyn DnsLookup>,
    zones: Vec<String>,
}

impl DnsBlacklistChecker {
    pub fn new(dns: Arc<dyn DnsLookup>, zones: Vec<String>) -> Self {
        Self { dns, zones }
    }

    fn query_name(ip: Ipv4Addr, zone: &str) -> String {
        let [a, b, c, d] = ip.octets();
        format!("{d}.{c}.{b}.{a}.{zone}")
    }

    /// Policy listings (end-user ranges) are weaker evidence than spam sources.
    fn listing_severity(answers: &[IpAddr]) -> Option<Severity> {
        answers
            .iter()
            .filter_map(|answer| match answer {
                IpAddr::V4(v4) => {
                    let [a, b, c, d] = v4.octets();
                    match (a, b, c, d) {
                        // 127.255.255.x are resolver/quota errors, not listings.
                        (127, 255, 255, _) => None,
                        (127, 0, 0, 10) | (127, 0, 0, 11) => Some(Severity::Low),
                        (127, _, _, _) => Some(Severity::Medium),
                        _ => None,
                    }
                }
                IpAddr::V6(_) => None,
            })
            .max()
    }
}

#[async_trait]
impl BlacklistChecker for DnsBlacklistChecker {
    async fn check_ip(&self, address: IpAddr) -> anyhow::Result<BlacklistReport> {
        let v4 = match address {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => {
                    log::debug!("Skipping blacklist lookup for IPv6 address {address}");
                    return Ok(BlacklistReport {
                        listed: false,
                        severity: None,
                        zones: Vec::new(),
                    });
                }
            },
        };
        if v4.is_private() || v4.is_loopback() || v4.is_link_local() {
            return Ok(BlacklistReport {
                listed: false,
                severity: None,
                zones: Vec::new(),
            });
        }

        let mut listed_zones = Vec::new();
        let mut worst: Option<Severity> = None;
        let mut failures = 0;
        for zone in &self.zones {
            let query = Self::query_name(v4, zone);
            match self.dns.ip(&query).await {
                Ok(answers) => {
                    if let Some(severity) = Self::listing_severity(&answers) {
                        log::info!("{v4} is listed on {zone} ({severity})");
                        listed_zones.push(zone.clone());
                        worst = worst.max(Some(severity));
                    }
                }
                Err(LookupError::NotFound(_)) => {}
                Err(e) => {
                    log::debug!("Blacklist query {query} failed: {e}");
                    failures += 1;
                }
            }
        }

        if failures > 0 && failures == self.zones.len() {
            anyhow::bail!("all {failures} blacklist zones failed for {v4}");
        }

        let severity = if listed_zones.len() >= 2 {
            Some(Severity::High)
        } else {
            worst
        };
        Ok(BlacklistReport {
            listed: !listed_zones.is_empty(),
            severity,
            zones: listed_zones,
        })
    }
}
