//! DNS responder configuration.
//!
//! `DnsConfig` is the serde-facing shape loaded from the config file.
//! `DnsRuntimeConfig` is the compiled, immutable snapshot the request
//! paths read: domains normalized to lowercase FQDN form, recursor
//! addresses validated, and the per-service TTL table split into an
//! exact-match map and a longest-prefix wildcard list. A reload builds a
//! fresh snapshot and swaps it wholesale; snapshots are never mutated.

use crate::errors::DnsError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SoaConfig {
    #[serde(default = "default_soa_refresh")]
    pub refresh: u32,
    #[serde(default = "default_soa_retry")]
    pub retry: u32,
    #[serde(default = "default_soa_expire")]
    pub expire: u32,
    #[serde(default)]
    pub min_ttl: u32,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            refresh: default_soa_refresh(),
            retry: default_soa_retry(),
            expire: default_soa_expire(),
            min_ttl: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Optional second domain served with identical answers.
    #[serde(default)]
    pub alt_domain: Option<String>,

    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    #[serde(default)]
    pub node_name: String,

    #[serde(default = "default_true")]
    pub allow_stale: bool,

    /// Reads older than this force a fresh, non-stale re-read.
    #[serde(default = "default_max_stale")]
    pub max_stale_secs: u64,

    #[serde(default)]
    pub node_ttl_secs: u64,

    /// Per-service TTLs in seconds. Keys ending in `*` match by prefix,
    /// exact keys win over wildcards.
    #[serde(default)]
    pub service_ttl: HashMap<String, u64>,

    /// Answer-count cap for non-EDNS0 UDP responses.
    #[serde(default = "default_udp_answer_limit")]
    pub udp_answer_limit: usize,

    /// Cap on A/AAAA answers per service query; 0 means unlimited.
    #[serde(default)]
    pub a_record_limit: usize,

    #[serde(default)]
    pub enable_truncate: bool,

    #[serde(default)]
    pub disable_compression: bool,

    #[serde(default)]
    pub only_passing: bool,

    #[serde(default = "default_true")]
    pub node_meta_txt: bool,

    /// Upstream resolvers for out-of-zone queries; port 53 assumed when
    /// omitted.
    #[serde(default)]
    pub recursors: Vec<String>,

    #[serde(default = "default_recursor_timeout")]
    pub recursor_timeout_secs: u64,

    #[serde(default)]
    pub use_cache: bool,

    #[serde(default)]
    pub cache_max_age_secs: u64,

    #[serde(default)]
    pub soa: SoaConfig,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            alt_domain: None,
            datacenter: default_datacenter(),
            node_name: String::new(),
            allow_stale: true,
            max_stale_secs: default_max_stale(),
            node_ttl_secs: 0,
            service_ttl: HashMap::new(),
            udp_answer_limit: default_udp_answer_limit(),
            a_record_limit: 0,
            enable_truncate: false,
            disable_compression: false,
            only_passing: false,
            node_meta_txt: true,
            recursors: vec![],
            recursor_timeout_secs: default_recursor_timeout(),
            use_cache: false,
            cache_max_age_secs: 0,
            soa: SoaConfig::default(),
        }
    }
}

fn default_domain() -> String {
    "corral".to_string()
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

fn default_true() -> bool {
    true
}

// Ten years: a stale read is effectively always accepted unless the
// operator tightens it.
fn default_max_stale() -> u64 {
    87_600 * 3600
}

fn default_udp_answer_limit() -> usize {
    3
}

fn default_recursor_timeout() -> u64 {
    2
}

fn default_soa_refresh() -> u32 {
    3600
}

fn default_soa_retry() -> u32 {
    600
}

fn default_soa_expire() -> u32 {
    86400
}

/// Lowercases a name and guarantees the trailing dot.
pub fn fqdn(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{lower}.")
    }
}

/// Compiled configuration snapshot. Replaced atomically on reload; request
/// handlers capture one `Arc` and use it for the whole request.
#[derive(Debug, Clone)]
pub struct DnsRuntimeConfig {
    pub domain: String,
    pub alt_domain: Option<String>,
    pub datacenter: String,
    pub node_name: String,
    pub allow_stale: bool,
    pub max_stale: Duration,
    pub node_ttl: Duration,
    pub udp_answer_limit: usize,
    pub a_record_limit: usize,
    pub enable_truncate: bool,
    pub disable_compression: bool,
    pub only_passing: bool,
    pub node_meta_txt: bool,
    pub recursors: Vec<SocketAddr>,
    pub recursor_timeout: Duration,
    pub use_cache: bool,
    pub cache_max_age: Duration,
    pub soa: SoaConfig,

    ttl_strict: FxHashMap<String, Duration>,
    /// `(prefix, ttl)` pairs sorted longest-prefix-first.
    ttl_wildcard: Vec<(String, Duration)>,
}

impl DnsRuntimeConfig {
    pub fn compile(cfg: &DnsConfig) -> Result<Self, DnsError> {
        let domain = fqdn(&cfg.domain);
        let alt_domain = match cfg.alt_domain.as_deref() {
            Some("") | None => None,
            Some(alt) => Some(fqdn(alt)),
        };

        let mut ttl_strict = FxHashMap::default();
        let mut ttl_wildcard = Vec::new();
        for (key, secs) in &cfg.service_ttl {
            let ttl = Duration::from_secs(*secs);
            match key.strip_suffix('*') {
                // A bare "*" lands here with an empty prefix and matches anything.
                Some(prefix) => ttl_wildcard.push((prefix.to_string(), ttl)),
                None => {
                    ttl_strict.insert(key.clone(), ttl);
                }
            }
        }
        ttl_wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let recursors = cfg
            .recursors
            .iter()
            .map(|r| recursor_addr(r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            domain,
            alt_domain,
            datacenter: cfg.datacenter.clone(),
            node_name: cfg.node_name.clone(),
            allow_stale: cfg.allow_stale,
            max_stale: Duration::from_secs(cfg.max_stale_secs),
            node_ttl: Duration::from_secs(cfg.node_ttl_secs),
            udp_answer_limit: cfg.udp_answer_limit,
            a_record_limit: cfg.a_record_limit,
            enable_truncate: cfg.enable_truncate,
            disable_compression: cfg.disable_compression,
            only_passing: cfg.only_passing,
            node_meta_txt: cfg.node_meta_txt,
            recursors,
            recursor_timeout: Duration::from_secs(cfg.recursor_timeout_secs),
            use_cache: cfg.use_cache,
            cache_max_age: Duration::from_secs(cfg.cache_max_age_secs),
            soa: cfg.soa.clone(),
            ttl_strict,
            ttl_wildcard,
        })
    }

    /// TTL for a service name: exact match first, then the longest
    /// matching wildcard prefix. `None` means no TTL configured (records
    /// are stamped with zero).
    pub fn ttl_for_service(&self, service: &str) -> Option<Duration> {
        if let Some(ttl) = self.ttl_strict.get(service) {
            return Some(*ttl);
        }
        self.ttl_wildcard
            .iter()
            .find(|(prefix, _)| service.starts_with(prefix.as_str()))
            .map(|(_, ttl)| *ttl)
    }

    pub fn recursors_enabled(&self) -> bool {
        !self.recursors.is_empty()
    }
}

/// Parses a recursor address, defaulting the port to 53 when omitted.
/// Accepts `1.2.3.4`, `1.2.3.4:8600`, `2001:db8::1` and `[2001:db8::1]:53`.
fn recursor_addr(recursor: &str) -> Result<SocketAddr, DnsError> {
    if let Ok(addr) = recursor.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = recursor.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
    }
    Err(DnsError::Config(format!(
        "invalid recursor address: {recursor}"
    )))
}
