//! Sender-authorization (SPF) evaluation.
//!
//! One call to [`SpfEvaluator::verify`] owns one [`VerificationState`];
//! every `include` and `redirect` descends with that same state, so the
//! lookup budget covers the whole call tree. Nothing here returns an
//! error to the caller: every outcome is an [`SpfResult`].

pub mod macros;
pub mod record;

use crate::config::SpfConfig;
use crate::dns::{DnsLookup, LookupError};
use record::{network_contains, Directive, Mechanism, SpfRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpfResult::None => "none",
            SpfResult::Neutral => "neutral",
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        };
        f.write_str(name)
    }
}

/// Immutable inputs of one verification.
#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    pub client: IpAddr,
    pub domain: String,
    pub sender: String,
    pub helo: Option<String>,
}

impl AuthorizationContext {
    pub fn new(client: IpAddr, domain: &str, sender: &str, helo: Option<&str>) -> Self {
        // IPv4-mapped IPv6 clients are evaluated as IPv4.
        let client = match client {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        let sender = if sender.trim().is_empty() {
            format!("postmaster@{}", helo.unwrap_or(&domain))
        } else if !sender.contains('@') {
            format!("postmaster@{}", sender.trim())
        } else {
            sender.trim().to_string()
        };
        Self {
            client,
            domain,
            sender,
            helo: helo.map(str::to_string),
        }
    }

    pub fn sender_local_part(&self) -> &str {
        self.sender
            .rsplit_once('@')
            .map(|(local, _)| local)
            .filter(|local| !local.is_empty())
            .unwrap_or("postmaster")
    }

    pub fn sender_domain(&self) -> &str {
        self.sender
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or(&self.domain)
    }
}

/// Per-call scratch. Created fresh by `verify` and threaded through every
/// recursive descent; never shared between calls.
#[derive(Debug)]
pub struct VerificationState {
    lookups: u32,
    void_lookups: u32,
    warnings: Vec<String>,
    include_chain: HashSet<String>,
    max_lookups: u32,
    max_void_lookups: u32,
}

impl VerificationState {
    fn new(limits: &SpfConfig) -> Self {
        Self {
            lookups: 0,
            void_lookups: 0,
            warnings: Vec::new(),
            include_chain: HashSet::new(),
            max_lookups: limits.max_lookups,
            max_void_lookups: limits.max_void_lookups,
        }
    }

    pub fn lookups(&self) -> u32 {
        self.lookups
    }

    pub fn void_lookups(&self) -> u32 {
        self.void_lookups
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn charge_lookup(&mut self) -> Eval<()> {
        if self.lookups >= self.max_lookups {
            return Err(Abort::Perm(format!(
                "DNS lookup limit of {} exceeded",
                self.max_lookups
            )));
        }
        self.lookups += 1;
        Ok(())
    }

    fn charge_void(&mut self, name: &str) -> Eval<()> {
        self.void_lookups += 1;
        log::debug!("Void lookup #{} for {name}", self.void_lookups);
        if self.void_lookups > self.max_void_lookups {
            return Err(Abort::Perm(format!(
                "void lookup limit of {} exceeded",
                self.max_void_lookups
            )));
        }
        Ok(())
    }

    fn enter(&mut self, domain: &str) -> Eval<()> {
        if !self.include_chain.insert(domain.to_string()) {
            return Err(Abort::Perm(format!("policy loop detected at {domain}")));
        }
        Ok(())
    }

    fn leave(&mut self, domain: &str) {
        self.include_chain.remove(domain);
    }

    fn warn(&mut self, warning: String) {
        log::debug!("SPF warning: {warning}");
        self.warnings.push(warning);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpfVerification {
    pub result: SpfResult,
    pub domain: String,
    /// Term that decided the result, e.g. `ip4:192.0.2.0/24`.
    pub mechanism: Option<String>,
    pub lookups: u32,
    pub void_lookups: u32,
    pub warnings: Vec<String>,
}

/// Evaluation aborts that unwind the whole call tree.
#[derive(Debug)]
enum Abort {
    Temp(String),
    Perm(String),
}

type Eval<T> = Result<T, Abort>;
type BoxedEval<'a> = Pin<Box<dyn Future<Output = Eval<Evaluated>> + Send + 'a>>;

#[derive(Debug)]
struct Evaluated {
    result: SpfResult,
    mechanism: Option<String>,
}

impl Evaluated {
    fn none() -> Self {
        Self {
            result: SpfResult::None,
            mechanism: None,
        }
    }
}

pub struct SpfEvaluator {
    dns: Arc<dyn DnsLookup>,
    limits: SpfConfig,
}

impl SpfEvaluator {
    pub fn new(dns: Arc<dyn DnsLookup>, limits: SpfConfig) -> Self {
        Self { dns, limits }
    }

    /// Evaluate `domain`'s policy for a message from `client_address`.
    /// Dropping the returned future cancels every pending lookup.
    pub async fn verify(
        &self,
        client_address: &str,
        domain: &str,
        sender: &str,
        helo: Option<&str>,
    ) -> SpfVerification {
        let domain_name = domain.trim().trim_end_matches('.').to_lowercase();

        let client: IpAddr = match client_address.trim().parse() {
            Ok(ip) => ip,
            Err(_) => {
                log::warn!("SPF check skipped: unparseable client address '{client_address}'");
                return SpfVerification {
                    result: SpfResult::PermError,
                    domain: domain_name,
                    mechanism: None,
                    lookups: 0,
                    void_lookups: 0,
                    warnings: vec![format!("invalid client address: {client_address}")],
                };
            }
        };

        if !is_valid_domain(&domain_name) {
            log::debug!("SPF check skipped: no usable domain in '{domain}'");
            return SpfVerification {
                result: SpfResult::None,
                domain: domain_name,
                mechanism: None,
                lookups: 0,
                void_lookups: 0,
                warnings: vec![format!("missing or invalid domain: '{domain}'")],
            };
        }

        let ctx = AuthorizationContext::new(client, &domain_name, sender, helo);
        let mut state = VerificationState::new(&self.limits);

        let outcome = self.check_host(&ctx, domain_name.clone(), &mut state).await;
        let (result, mechanism) = match outcome {
            Ok(evaluated) => (evaluated.result, evaluated.mechanism),
            Err(Abort::Temp(reason)) => {
                state.warn(reason);
                (SpfResult::TempError, None)
            }
            Err(Abort::Perm(reason)) => {
                state.warn(reason);
                (SpfResult::PermError, None)
            }
        };

        log::info!(
            "SPF {result} for {} from {} ({} lookups)",
            ctx.domain,
            ctx.client,
            state.lookups
        );

        SpfVerification {
            result,
            domain: domain_name,
            mechanism,
            lookups: state.lookups,
            void_lookups: state.void_lookups,
            warnings: state.warnings,
        }
    }

    fn check_host<'a>(
        &'a self,
        ctx: &'a AuthorizationContext,
        domain: String,
        state: &'a mut VerificationState,
    ) -> BoxedEval<'a> {
        Box::pin(async move {
            if !is_valid_domain(&domain) {
                return Err(Abort::Perm(format!("invalid target domain '{domain}'")));
            }
            state.enter(&domain)?;
            let evaluated = self.evaluate_domain(ctx, &domain, state).await?;
            state.leave(&domain);
            Ok(evaluated)
        })
    }

    async fn evaluate_domain(
        &self,
        ctx: &AuthorizationContext,
        domain: &str,
        state: &mut VerificationState,
    ) -> Eval<Evaluated> {
        let record = match self.fetch_policy(domain, state).await? {
            Some(record) => record,
            None => return Ok(Evaluated::none()),
        };

        for directive in &record.directives {
            if self.matches(ctx, domain, directive, state).await? {
                log::debug!("SPF {domain}: matched '{}'", directive.text);
                return Ok(Evaluated {
                    result: directive.qualifier.result(),
                    mechanism: Some(directive.text.clone()),
                });
            }
        }

        if let Some(redirect) = &record.redirect {
            let target = macros::expand(redirect, ctx, domain).map_err(Abort::Perm)?;
            log::debug!("SPF {domain}: following redirect to {target}");
            let nested = self.check_host(ctx, target.clone(), state).await?;
            if nested.result == SpfResult::None {
                return Err(Abort::Perm(format!("redirect target {target} has no policy")));
            }
            return Ok(nested);
        }

        Ok(Evaluated {
            result: SpfResult::Neutral,
            mechanism: None,
        })
    }

    /// Fetch and parse the single policy record of `domain`.
    async fn fetch_policy(
        &self,
        domain: &str,
        state: &mut VerificationState,
    ) -> Eval<Option<SpfRecord>> {
        state.charge_lookup()?;
        let records = match self.dns.txt(domain).await {
            Ok(records) => records,
            Err(LookupError::NotFound(_)) => {
                state.charge_void(domain)?;
                return Ok(None);
            }
            Err(LookupError::Transient { reason, .. }) => {
                return Err(Abort::Temp(format!("policy lookup for {domain} failed: {reason}")))
            }
        };

        let mut policies: Vec<&String> = records
            .iter()
            .filter(|txt| record::is_spf_record(txt))
            .collect();
        match policies.len() {
            0 => Ok(None),
            1 => {
                let txt = policies.remove(0);
                record::parse_record(txt)
                    .map(Some)
                    .map_err(|e| Abort::Perm(format!("malformed policy for {domain}: {e}")))
            }
            n => {
                state.warn(format!(
                    "{domain} publishes {n} policy records; treating as absent"
                ));
                Ok(None)
            }
        }
    }

    async fn matches(
        &self,
        ctx: &AuthorizationContext,
        domain: &str,
        directive: &Directive,
        state: &mut VerificationState,
    ) -> Eval<bool> {
        match &directive.mechanism {
            Mechanism::All => Ok(true),
            Mechanism::Ip4 { addr, prefix } => {
                Ok(network_contains(IpAddr::V4(*addr), *prefix, ctx.client))
            }
            Mechanism::Ip6 { addr, prefix } => {
                Ok(network_contains(IpAddr::V6(*addr), *prefix, ctx.client))
            }
            Mechanism::A {
                domain: target,
                cidr4,
                cidr6,
            } => {
                let target = self.target_domain(target.as_deref(), ctx, domain)?;
                state.charge_lookup()?;
                let addrs = self.resolve_ips(&target, state, true).await?;
                Ok(addrs
                    .iter()
                    .any(|addr| address_matches(*addr, ctx.client, *cidr4, *cidr6)))
            }
            Mechanism::Mx {
                domain: target,
                cidr4,
                cidr6,
            } => {
                let target = self.target_domain(target.as_deref(), ctx, domain)?;
                state.charge_lookup()?;
                let exchanges = match self.dns.mx(&target).await {
                    Ok(exchanges) => exchanges,
                    Err(LookupError::NotFound(_)) => {
                        state.charge_void(&target)?;
                        return Ok(false);
                    }
                    Err(LookupError::Transient { reason, .. }) => {
                        return Err(Abort::Temp(format!("MX lookup for {target} failed: {reason}")))
                    }
                };
                if exchanges.len() > self.limits.max_mx_hosts {
                    return Err(Abort::Perm(format!(
                        "{target} has {} MX hosts, limit is {}",
                        exchanges.len(),
                        self.limits.max_mx_hosts
                    )));
                }
                for exchange in &exchanges {
                    let addrs = self.resolve_ips(exchange, state, false).await?;
                    if addrs
                        .iter()
                        .any(|addr| address_matches(*addr, ctx.client, *cidr4, *cidr6))
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Mechanism::Ptr(target) => {
                let target = self.target_domain(target.as_deref(), ctx, domain)?;
                state.charge_lookup()?;
                let names = match self.dns.ptr(ctx.client).await {
                    Ok(names) => names,
                    Err(LookupError::NotFound(_)) => {
                        state.charge_void(&ctx.client.to_string())?;
                        return Ok(false);
                    }
                    // A failing reverse lookup simply does not match.
                    Err(LookupError::Transient { .. }) => return Ok(false),
                };
                for name in names.iter().take(self.limits.max_mx_hosts) {
                    let in_domain = name == &target || name.ends_with(&format!(".{target}"));
                    if !in_domain {
                        continue;
                    }
                    if let Ok(addrs) = self.dns.ip(name).await {
                        if addrs.contains(&ctx.client) {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            Mechanism::Exists(spec) => {
                let target = macros::expand(spec, ctx, domain).map_err(Abort::Perm)?;
                state.charge_lookup()?;
                let addrs = self.resolve_ips(&target, state, true).await?;
                Ok(!addrs.is_empty())
            }
            Mechanism::Include(spec) => {
                let target = macros::expand(spec, ctx, domain).map_err(Abort::Perm)?;
                log::debug!("SPF {domain}: descending into include:{target}");
                let nested = self.check_host(ctx, target.clone(), state).await?;
                match nested.result {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                    SpfResult::TempError => {
                        Err(Abort::Temp(format!("include:{target} failed temporarily")))
                    }
                    SpfResult::None | SpfResult::PermError => Err(Abort::Perm(format!(
                        "include:{target} has no usable policy"
                    ))),
                }
            }
        }
    }

    fn target_domain(
        &self,
        spec: Option<&str>,
        ctx: &AuthorizationContext,
        domain: &str,
    ) -> Eval<String> {
        match spec {
            Some(spec) => macros::expand(spec, ctx, domain).map_err(Abort::Perm),
            None => Ok(domain.to_string()),
        }
    }

    async fn resolve_ips(
        &self,
        name: &str,
        state: &mut VerificationState,
        count_void: bool,
    ) -> Eval<Vec<IpAddr>> {
        match self.dns.ip(name).await {
            Ok(addrs) => Ok(addrs),
            Err(LookupError::NotFound(_)) => {
                if count_void {
                    state.charge_void(name)?;
                }
                Ok(Vec::new())
            }
            Err(LookupError::Transient { reason, .. }) => {
                Err(Abort::Temp(format!("address lookup for {name} failed: {reason}")))
            }
        }
    }
}

fn address_matches(candidate: IpAddr, client: IpAddr, cidr4: u8, cidr6: u8) -> bool {
    match candidate {
        IpAddr::V4(_) => network_contains(candidate, cidr4, client),
        IpAddr::V6(_) => network_contains(candidate, cidr6, client),
    }
}

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.contains('.')
        && domain
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= 63)
}
