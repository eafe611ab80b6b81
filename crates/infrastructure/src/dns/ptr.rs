//! Reverse (PTR) lookups.
//!
//! An `in-addr.arpa.` / `ip6.arpa.` question is matched against node
//! addresses first, then against advertised service addresses. No match
//! leaves the answer empty and the server falls back to the recursors.

use crate::dns::dispatch::QueryEngine;
use crate::dns::message::ResponseMessage;
use crate::dns::records::parse_name;
use corral_dns_application::ports::{DcSpecificRequest, QueryOptions, ServiceSpecificRequest};
use corral_dns_domain::config::fqdn;
use hickory_proto::rr::rdata::PTR;
use hickory_proto::rr::{RData, Record};
use std::net::IpAddr;
use tracing::warn;

impl QueryEngine {
    pub async fn handle_ptr(&self, qname: &str, resp: &mut ResponseMessage) {
        let datacenter = self.cfg.datacenter.clone();
        let domain = &self.cfg.domain;

        let req = DcSpecificRequest {
            datacenter: datacenter.clone(),
            options: QueryOptions::default(),
        };
        match self.reader.list_nodes(&self.cfg, req).await {
            Ok(reply) => {
                for node in &reply.nodes {
                    let Ok(ip) = node.address.parse::<IpAddr>() else {
                        continue;
                    };
                    if reverse_addr(ip) != qname {
                        continue;
                    }
                    let target = fqdn(&format!(
                        "{}.node.{}.{}",
                        node.name, node.datacenter, domain
                    ));
                    if let (Some(owner), Some(ptr)) = (parse_name(qname), parse_name(&target)) {
                        resp.answers
                            .push(Record::from_rdata(owner, 0, RData::PTR(PTR(ptr))));
                    }
                    break;
                }
            }
            Err(e) => warn!(error = %e, "node list lookup failed for reverse query"),
        }

        // Only consult service addresses when no node matched.
        if resp.answers.is_empty() {
            let Some(ip) = extract_addr_from_reverse(qname) else {
                return;
            };
            let req = ServiceSpecificRequest {
                datacenter,
                service: String::new(),
                tag: None,
                connect: false,
                service_address: Some(ip.to_string()),
                options: QueryOptions::default(),
            };
            match self.reader.service_nodes(&self.cfg, req).await {
                Ok(reply) => {
                    for instance in &reply.instances {
                        if instance.service.address != ip.to_string() {
                            continue;
                        }
                        let target = fqdn(&format!("{}.service.{}", instance.service.name, domain));
                        if let (Some(owner), Some(ptr)) = (parse_name(qname), parse_name(&target))
                        {
                            resp.answers
                                .push(Record::from_rdata(owner, 0, RData::PTR(PTR(ptr))));
                        }
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "service lookup failed for reverse query"),
            }
        }
    }
}

/// Reverse-lookup name for an address, lowercased with the trailing dot.
pub fn reverse_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(74);
            for b in v6.octets().iter().rev() {
                for nibble in [b & 0xF, b >> 4] {
                    out.push(char::from_digit(nibble as u32, 16).unwrap_or('0'));
                    out.push('.');
                }
            }
            out.push_str("ip6.arpa.");
            out
        }
    }
}

/// Inverse of [`reverse_addr`]: the address encoded in a reverse-lookup
/// name, or `None` when the name is malformed.
pub fn extract_addr_from_reverse(qname: &str) -> Option<IpAddr> {
    if let Some(rest) = qname.strip_suffix(".in-addr.arpa.") {
        let octets: Vec<&str> = rest.split('.').collect();
        if octets.len() != 4 {
            return None;
        }
        let mut addr = [0u8; 4];
        for (i, part) in octets.iter().rev().enumerate() {
            addr[i] = part.parse().ok()?;
        }
        return Some(IpAddr::from(addr));
    }
    if let Some(rest) = qname.strip_suffix(".ip6.arpa.") {
        let nibbles: Vec<&str> = rest.split('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        let mut addr = [0u8; 16];
        for (i, part) in nibbles.iter().rev().enumerate() {
            let nibble = u8::from_str_radix(part, 16).ok()?;
            if part.len() != 1 {
                return None;
            }
            if i % 2 == 0 {
                addr[i / 2] = nibble << 4;
            } else {
                addr[i / 2] |= nibble;
            }
        }
        return Some(IpAddr::from(addr));
    }
    None
}
