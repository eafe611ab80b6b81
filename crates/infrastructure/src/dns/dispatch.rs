//! Query-name parsing and lookup dispatch.
//!
//! A query name is classified by scanning its labels right to left for a
//! keyword label (`service`, `connect`, `node`, `query`, `addr`). Labels
//! after the keyword select the datacenter, labels before it carry the
//! lookup arguments. Anything that fails to parse is NXDOMAIN.

use crate::dns::message::ResponseMessage;
use crate::dns::recurse::RecursorClient;
use corral_dns_application::ports::AddressTranslator;
use corral_dns_application::CatalogReader;
use corral_dns_domain::{DnsError, DnsRuntimeConfig};
use hickory_proto::rr::RecordType;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

/// Internal CNAME chains re-enter the dispatcher at most this deep.
pub const MAX_RECURSION_LEVEL_DEFAULT: usize = 3;

/// Per-request view of the engine: one configuration snapshot, the catalog
/// reader and, when configured, the upstream recursor client.
pub struct QueryEngine {
    pub cfg: Arc<DnsRuntimeConfig>,
    pub reader: Arc<CatalogReader>,
    pub translator: Arc<dyn AddressTranslator>,
    pub recursor: Option<Arc<RecursorClient>>,
    /// Whether the client sent EDNS0; relaxes the recursion record cap.
    pub has_edns: bool,
}

impl QueryEngine {
    /// The served domain the question falls under; alt domain answers keep
    /// alt-domain names throughout.
    pub fn response_domain(&self, qname: &str) -> &str {
        response_domain_name(qname, &self.cfg.domain, self.cfg.alt_domain.as_deref())
    }

    /// Strips the matched domain suffix, leaving the payload labels.
    pub fn trim_domain(&self, qname: &str) -> String {
        trim_domain_name(qname, &self.cfg.domain, self.cfg.alt_domain.as_deref())
    }

    pub fn in_domain(&self, qname: &str) -> bool {
        in_domain_name(qname, &self.cfg.domain)
            || self
                .cfg
                .alt_domain
                .as_deref()
                .is_some_and(|alt| in_domain_name(qname, alt))
    }

    /// Routes a parsed question to the matching lookup. `qname` is the
    /// lowercased FQDN form of the question name.
    pub async fn dispatch(
        &self,
        qname: &str,
        qtype: RecordType,
        src_ip: Option<IpAddr>,
        resp: &mut ResponseMessage,
        max_recursion: usize,
    ) -> Result<(), DnsError> {
        let trimmed = self.trim_domain(qname);
        let labels: Vec<&str> = trimmed.split('.').filter(|l| !l.is_empty()).collect();

        let mut keyword_at = None;
        for i in (0..labels.len()).rev() {
            if matches!(labels[i], "service" | "connect" | "node" | "query" | "addr") {
                keyword_at = Some(i);
                break;
            }
        }
        let (at, kind) = match keyword_at {
            Some(at) => (at, labels[at]),
            // RFC 2782 shorthand directly under the domain: an SRV
            // question whose first label is underscored implies `service`.
            None if qtype == RecordType::SRV
                && labels.first().is_some_and(|l| l.starts_with('_')) =>
            {
                (labels.len(), "service")
            }
            None => return Err(DnsError::NameNotFound),
        };
        let parts = &labels[..at];
        let datacenter = parse_datacenter(
            labels.get(at + 1..).unwrap_or(&[]),
            &self.cfg.datacenter,
        )
        .ok_or(DnsError::NameNotFound)?;

        match kind {
            "service" => {
                if parts.is_empty() {
                    return Err(DnsError::NameNotFound);
                }
                // RFC 2782: _<service>._<tag>; the pseudo-tag "tcp" means
                // no tag filter at all.
                if parts.len() == 2 && parts[0].starts_with('_') && parts[1].starts_with('_') {
                    let service = &parts[0][1..];
                    let tag = match &parts[1][1..] {
                        "tcp" => None,
                        tag => Some(tag.to_string()),
                    };
                    self.service_lookup(
                        datacenter,
                        service,
                        tag,
                        false,
                        qname,
                        qtype,
                        resp,
                        max_recursion,
                    )
                    .await
                } else {
                    // Legacy <tag>.<service> form; tags may contain dots.
                    let n = parts.len();
                    let tag = if n >= 2 {
                        Some(parts[..n - 1].join("."))
                    } else {
                        None
                    };
                    self.service_lookup(
                        datacenter,
                        parts[n - 1],
                        tag,
                        false,
                        qname,
                        qtype,
                        resp,
                        max_recursion,
                    )
                    .await
                }
            }
            "connect" => {
                if parts.is_empty() {
                    return Err(DnsError::NameNotFound);
                }
                self.service_lookup(
                    datacenter,
                    parts[parts.len() - 1],
                    None,
                    true,
                    qname,
                    qtype,
                    resp,
                    max_recursion,
                )
                .await
            }
            "node" => {
                if parts.is_empty() {
                    return Err(DnsError::NameNotFound);
                }
                // Node names may contain dots.
                let node = parts.join(".");
                self.node_lookup(datacenter, node, qname, qtype, resp, max_recursion)
                    .await
            }
            "query" => {
                if parts.is_empty() {
                    return Err(DnsError::NameNotFound);
                }
                // RFC 2782 form: _<query>._<protocol>; the protocol label
                // is discarded.
                let query = if parts.len() >= 2
                    && parts[0].starts_with('_')
                    && parts[parts.len() - 1].starts_with('_')
                {
                    let joined = parts[..parts.len() - 1].join(".");
                    joined.strip_prefix('_').unwrap_or(&joined).to_string()
                } else {
                    parts.join(".")
                };
                self.prepared_query_lookup(datacenter, query, src_ip, qname, qtype, resp, max_recursion)
                    .await
            }
            "addr" => {
                if parts.len() != 1 {
                    return Err(DnsError::NameNotFound);
                }
                self.addr_lookup(parts[0], qname, qtype, resp)
            }
            _ => Err(DnsError::NameNotFound),
        }
    }

    /// Boxed form for the internal CNAME re-entry.
    pub(crate) fn dispatch_boxed<'a>(
        &'a self,
        qname: &'a str,
        qtype: RecordType,
        src_ip: Option<IpAddr>,
        resp: &'a mut ResponseMessage,
        max_recursion: usize,
    ) -> Pin<Box<dyn Future<Output = Result<(), DnsError>> + Send + 'a>> {
        Box::pin(self.dispatch(qname, qtype, src_ip, resp, max_recursion))
    }
}

/// Zero suffix labels select the local datacenter, one selects that
/// datacenter, more is invalid.
fn parse_datacenter(suffixes: &[&str], default: &str) -> Option<String> {
    match suffixes {
        [] => Some(default.to_string()),
        [dc] => Some((*dc).to_string()),
        _ => None,
    }
}

fn in_domain_name(qname: &str, domain: &str) -> bool {
    qname == domain || qname.ends_with(&format!(".{domain}"))
}

pub(crate) fn trim_domain_name(qname: &str, domain: &str, alt_domain: Option<&str>) -> String {
    let alt = alt_domain.unwrap_or("");
    // When one domain is a suffix of the other, strip the longer first.
    let (longer, shorter) = if alt.len() > domain.len() {
        (alt, domain)
    } else {
        (domain, alt)
    };
    if in_domain_name(qname, longer) {
        return qname.strip_suffix(longer).unwrap_or(qname).to_string();
    }
    if !shorter.is_empty() {
        return qname.strip_suffix(shorter).unwrap_or(qname).to_string();
    }
    qname.to_string()
}

pub(crate) fn response_domain_name<'a>(
    qname: &str,
    domain: &'a str,
    alt_domain: Option<&'a str>,
) -> &'a str {
    match alt_domain {
        Some(alt) if in_domain_name(qname, alt) => alt,
        _ => domain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_strips_primary_domain() {
        assert_eq!(
            trim_domain_name("db.service.corral.", "corral.", None),
            "db.service."
        );
        assert_eq!(trim_domain_name("corral.", "corral.", None), "");
    }

    #[test]
    fn trim_strips_alt_domain() {
        assert_eq!(
            trim_domain_name("db.service.alt.example.", "corral.", Some("alt.example.")),
            "db.service."
        );
    }

    #[test]
    fn trim_prefers_longer_suffix() {
        // One served domain nested under the other: the longer must win.
        assert_eq!(
            trim_domain_name("db.service.dev.corral.", "corral.", Some("dev.corral.")),
            "db.service."
        );
    }

    #[test]
    fn response_domain_tracks_question_suffix() {
        assert_eq!(
            response_domain_name("db.service.corral.", "corral.", Some("alt.example.")),
            "corral."
        );
        assert_eq!(
            response_domain_name("db.service.alt.example.", "corral.", Some("alt.example.")),
            "alt.example."
        );
        // Out-of-zone names fall back to the primary domain.
        assert_eq!(
            response_domain_name("4.3.2.1.in-addr.arpa.", "corral.", Some("alt.example.")),
            "corral."
        );
    }

    #[test]
    fn datacenter_suffix_parsing() {
        assert_eq!(parse_datacenter(&[], "dc1"), Some("dc1".to_string()));
        assert_eq!(parse_datacenter(&["dc2"], "dc1"), Some("dc2".to_string()));
        assert_eq!(parse_datacenter(&["a", "b"], "dc1"), None);
    }

    #[test]
    fn similar_names_are_not_in_domain() {
        assert!(in_domain_name("db.service.corral.", "corral."));
        assert!(in_domain_name("corral.", "corral."));
        assert!(!in_domain_name("mycorral.", "corral."));
        assert!(!in_domain_name("db.service.notcorral.", "corral."));
    }
}
