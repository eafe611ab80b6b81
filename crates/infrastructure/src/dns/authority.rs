//! Zone authority records: SOA synthesis and NS answers backed by the
//! cluster's own server nodes.

use crate::dns::dispatch::QueryEngine;
use crate::dns::message::ResponseMessage;
use crate::dns::records::{node_canonical_name, parse_name};
use corral_dns_application::ports::{QueryOptions, ServiceSpecificRequest};
use hickory_proto::rr::rdata::{NS, SOA};
use hickory_proto::rr::{RData, Record, RecordType};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Registered service name of the cluster's own servers; NS answers point
/// at its healthy instances.
pub const CLUSTER_SERVICE_NAME: &str = "corral";

/// Server nodes whose names cannot appear in a DNS label are skipped when
/// building NS answers.
fn valid_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl QueryEngine {
    /// Synthesized SOA for the domain the question falls under. The serial
    /// is the current epoch second; the catalog has no update counter to
    /// derive one from.
    pub fn soa_record(&self, qname: &str) -> Option<Record> {
        let domain = self.response_domain(qname);
        let owner = parse_name(domain)?;
        let mname = parse_name(&format!("ns.{domain}"))?;
        let rname = parse_name(&format!("hostmaster.{domain}"))?;
        let serial = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let soa = &self.cfg.soa;
        Some(Record::from_rdata(
            owner,
            soa.min_ttl,
            RData::SOA(SOA::new(
                mname,
                rname,
                serial,
                soa.refresh as i32,
                soa.retry as i32,
                soa.expire as i32,
                soa.min_ttl,
            )),
        ))
    }

    /// Marks a negative answer by placing the SOA in the authority section.
    pub fn add_soa(&self, resp: &mut ResponseMessage, qname: &str) {
        if let Some(soa) = self.soa_record(qname) {
            resp.authorities.push(soa);
        }
    }

    /// Up to three NS records naming healthy cluster servers, plus their
    /// glue. Empty on any catalog failure; the caller answers with what it
    /// has.
    pub async fn nameservers(
        &self,
        qname: &str,
        max_recursion: usize,
    ) -> (Vec<Record>, Vec<Record>) {
        let req = ServiceSpecificRequest {
            datacenter: self.cfg.datacenter.clone(),
            service: CLUSTER_SERVICE_NAME.to_string(),
            tag: None,
            connect: false,
            service_address: None,
            options: QueryOptions::default(),
        };
        let reply = match self.reader.service_nodes(&self.cfg, req).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "unable to get list of servers");
                return (Vec::new(), Vec::new());
            }
        };
        if reply.instances.is_empty() {
            warn!("no servers found");
            return (Vec::new(), Vec::new());
        }

        let mut instances = reply.instances;
        fastrand::shuffle(&mut instances);

        let domain = self.response_domain(qname).to_string();
        let Some(owner) = parse_name(&domain) else {
            return (Vec::new(), Vec::new());
        };
        let ttl = self.cfg.node_ttl;
        let ttl_secs = ttl.as_secs() as u32;

        let mut ns = Vec::new();
        let mut glue = Vec::new();
        for instance in &instances {
            let node_name = &instance.node.name;
            if !valid_dns_label(node_name) {
                warn!(node = %node_name, "skipping invalid node name for NS answer");
                continue;
            }
            let target = node_canonical_name(&instance.node, &domain);
            let Some(target_name) = parse_name(&target) else {
                continue;
            };
            ns.push(Record::from_rdata(
                owner.clone(),
                ttl_secs,
                RData::NS(NS(target_name)),
            ));
            glue.extend(
                self.make_record_from_node(&instance.node, RecordType::ANY, &target, ttl, max_recursion)
                    .await,
            );
            if ns.len() >= 3 {
                break;
            }
        }
        (ns, glue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_validation() {
        assert!(valid_dns_label("server-1"));
        assert!(valid_dns_label("abc123"));
        assert!(!valid_dns_label("bad.name"));
        assert!(!valid_dns_label("under_score"));
        assert!(!valid_dns_label(""));
    }
}
