//! Record synthesis for catalog lookups.
//!
//! The builders here turn catalog instances into answer and additional
//! records. The per-instance precedence (node record, address-encoded
//! record, or external CNAME chain) lives in [`QueryEngine::node_service_records`];
//! everything else hangs off it.

use crate::dns::dispatch::QueryEngine;
use crate::dns::message::ResponseMessage;
use corral_dns_application::ports::{
    NodeServicesReply, NodeSpecificRequest, PreparedQueryExecuteRequest, QueryOptions,
    ServiceSpecificRequest,
};
use corral_dns_domain::catalog::{CheckServiceInstance, Node};
use corral_dns_domain::config::fqdn;
use corral_dns_domain::DnsError;
use hickory_proto::rr::rdata::{A, AAAA, CNAME, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustc_hash::FxHashSet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Cap on records pulled in by CNAME chasing when the client did not
/// negotiate EDNS0.
pub(crate) const MAX_RECURSE_RECORDS: usize = 5;

impl QueryEngine {
    pub(crate) async fn service_lookup(
        &self,
        datacenter: String,
        service: &str,
        tag: Option<String>,
        connect: bool,
        qname: &str,
        qtype: RecordType,
        resp: &mut ResponseMessage,
        max_recursion: usize,
    ) -> Result<(), DnsError> {
        let req = ServiceSpecificRequest {
            datacenter: datacenter.clone(),
            service: service.to_string(),
            tag,
            connect,
            service_address: None,
            options: QueryOptions::default(),
        };
        let reply = self.reader.service_nodes(&self.cfg, req).await?;
        if reply.instances.is_empty() {
            return Err(DnsError::NameNotFound);
        }

        let mut instances = reply.instances;
        fastrand::shuffle(&mut instances);

        let ttl = self.cfg.ttl_for_service(service).unwrap_or(Duration::ZERO);
        if qtype == RecordType::SRV {
            self.service_srv_records(&datacenter, &instances, qname, ttl, resp, max_recursion)
                .await;
        } else {
            self.service_node_records(&datacenter, &instances, qname, qtype, ttl, resp, max_recursion)
                .await;
        }
        Ok(())
    }

    pub(crate) async fn node_lookup(
        &self,
        datacenter: String,
        node: String,
        qname: &str,
        qtype: RecordType,
        resp: &mut ResponseMessage,
        max_recursion: usize,
    ) -> Result<(), DnsError> {
        if !matches!(
            qtype,
            RecordType::ANY | RecordType::A | RecordType::AAAA | RecordType::TXT
        ) {
            return Ok(());
        }

        let req = NodeSpecificRequest {
            datacenter,
            node,
            options: QueryOptions::default(),
        };
        let NodeServicesReply { node, .. } = self.reader.node_services(&self.cfg, req).await?;
        let Some(node) = node else {
            return Err(DnsError::NameNotFound);
        };

        let ttl = self.cfg.node_ttl;
        if matches!(qtype, RecordType::ANY | RecordType::A | RecordType::AAAA) {
            let records = self
                .make_record_from_node(&node, qtype, qname, ttl, max_recursion)
                .await;
            resp.answers.extend(records);
        }

        if self.cfg.node_meta_txt || qtype == RecordType::TXT || qtype == RecordType::ANY {
            let metas = generate_meta(qname, &node, ttl);
            if qtype == RecordType::TXT || qtype == RecordType::ANY {
                resp.answers.extend(metas);
            } else {
                resp.extras.extend(metas);
            }
        }
        Ok(())
    }

    pub(crate) async fn prepared_query_lookup(
        &self,
        datacenter: String,
        query: String,
        src_ip: Option<IpAddr>,
        qname: &str,
        qtype: RecordType,
        resp: &mut ResponseMessage,
        max_recursion: usize,
    ) -> Result<(), DnsError> {
        let req = PreparedQueryExecuteRequest {
            datacenter,
            query_id_or_name: query,
            source_ip: src_ip,
            options: QueryOptions::default(),
        };
        let reply = self.reader.prepared_query(&self.cfg, req).await?;

        // Answers may be sorted by network distance to the client.
        resp.ecs_global = false;

        if reply.instances.is_empty() {
            return Err(DnsError::NameNotFound);
        }

        let ttl = reply
            .dns_ttl
            .or_else(|| self.cfg.ttl_for_service(&reply.service))
            .unwrap_or(Duration::ZERO);

        if qtype == RecordType::SRV {
            self.service_srv_records(
                &reply.datacenter,
                &reply.instances,
                qname,
                ttl,
                resp,
                max_recursion,
            )
            .await;
        } else {
            self.service_node_records(
                &reply.datacenter,
                &reply.instances,
                qname,
                qtype,
                ttl,
                resp,
                max_recursion,
            )
            .await;
        }
        Ok(())
    }

    /// `<hex-ip>.addr` lookups decode the label straight back to an
    /// address record. Eight hex digits are an IPv4 address, thirty-two an
    /// IPv6 one; anything else does not name a record. The record lands in
    /// the answer section only when the question type matches the address
    /// family, otherwise it rides along as an additional.
    pub(crate) fn addr_lookup(
        &self,
        hex_label: &str,
        qname: &str,
        qtype: RecordType,
        resp: &mut ResponseMessage,
    ) -> Result<(), DnsError> {
        let bytes = decode_hex(hex_label).ok_or(DnsError::NameNotFound)?;
        let ip = match bytes.len() {
            4 => IpAddr::from(<[u8; 4]>::try_from(bytes.as_slice()).map_err(|_| DnsError::NameNotFound)?),
            16 => IpAddr::from(<[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| DnsError::NameNotFound)?),
            _ => return Err(DnsError::NameNotFound),
        };
        let owner = parse_name(qname).ok_or(DnsError::NameNotFound)?;
        let ttl = self.cfg.node_ttl.as_secs() as u32;
        if let Some(rr) = make_ip_record(RecordType::ANY, ip, &owner, ttl) {
            let in_answer = match ip {
                IpAddr::V4(_) => matches!(qtype, RecordType::A | RecordType::ANY),
                IpAddr::V6(_) => matches!(qtype, RecordType::AAAA | RecordType::ANY),
            };
            if in_answer {
                resp.answers.push(rr);
            } else {
                resp.extras.push(rr);
            }
        }
        Ok(())
    }

    /// A/AAAA-style assembly: one answer set per instance, deduplicated on
    /// the first record, CNAME answers held back unless nothing direct
    /// turns up.
    pub(crate) async fn service_node_records(
        &self,
        dc: &str,
        instances: &[CheckServiceInstance],
        qname: &str,
        qtype: RecordType,
        ttl: Duration,
        resp: &mut ResponseMessage,
        max_recursion: usize,
    ) {
        let mut handled = FxHashSet::default();
        let mut answer_cname: Option<Vec<Record>> = None;
        let mut count = 0usize;

        for instance in instances {
            let (records, _) = self
                .node_service_records(dc, instance, qname, qtype, ttl, max_recursion)
                .await;
            if records.is_empty() {
                continue;
            }
            // A node carrying the same service on several ports yields
            // identical address records; keep the first.
            if !handled.insert(records[0].to_string()) {
                continue;
            }
            if records[0].record_type() == RecordType::CNAME {
                if answer_cname.is_none() {
                    answer_cname = Some(records);
                }
            } else {
                resp.answers.extend(records);
                count += 1;
                if count == self.cfg.a_record_limit {
                    break;
                }
            }
        }

        if resp.answers.is_empty() {
            if let Some(cname) = answer_cname {
                resp.answers = cname;
            }
        }
    }

    /// SRV assembly: instances deduplicated on (node, address, port), node
    /// metadata added as TXT glue.
    pub(crate) async fn service_srv_records(
        &self,
        dc: &str,
        instances: &[CheckServiceInstance],
        qname: &str,
        ttl: Duration,
        resp: &mut ResponseMessage,
        max_recursion: usize,
    ) {
        let mut handled = FxHashSet::default();

        for instance in instances {
            let service_addr = self.translator.translate_service_address(
                dc,
                &instance.service.address,
                &instance.service.tagged_addresses,
            );
            let port = self.translator.translate_service_port(
                dc,
                instance.service.port,
                &instance.service.tagged_addresses,
            );
            let tuple = format!("{}:{}:{}", instance.node.name, service_addr, port);
            if !handled.insert(tuple) {
                continue;
            }

            let (answers, extra) = self
                .node_service_records(dc, instance, qname, RecordType::SRV, ttl, max_recursion)
                .await;
            resp.answers.extend(answers);
            resp.extras.extend(extra);

            if self.cfg.node_meta_txt {
                let owner = node_canonical_name(&instance.node, self.response_domain(qname));
                resp.extras.extend(generate_meta(&owner, &instance.node, ttl));
            }
        }
    }

    /// Per-instance record shape. Precedence:
    ///   1. no service address, node address is an IP: plain node record,
    ///      unless a tagged substitution rewrote the node address, in which
    ///      case the address is encoded into the name to avoid leaking the
    ///      internal one;
    ///   2. no service address, node address is a hostname: external CNAME
    ///      chain;
    ///   3. service address is an IP: address-encoded record;
    ///   4. service address equals the question and the node address is an
    ///      IP: node address record (a CNAME onto itself helps nobody);
    ///   5. service address is a hostname: external CNAME chain.
    pub(crate) async fn node_service_records(
        &self,
        dc: &str,
        instance: &CheckServiceInstance,
        qname: &str,
        qtype: RecordType,
        ttl: Duration,
        max_recursion: usize,
    ) -> (Vec<Record>, Vec<Record>) {
        let service_addr = self.translator.translate_service_address(
            dc,
            &instance.service.address,
            &instance.service.tagged_addresses,
        );
        let node_addr = self.translator.translate_node_address(
            &instance.node.datacenter,
            &instance.node.address,
            &instance.node.tagged_addresses,
        );
        let node_ip = node_addr.parse::<IpAddr>().ok();
        let service_ip = service_addr.parse::<IpAddr>().ok();

        if service_addr.is_empty() {
            if let Some(ip) = node_ip {
                if instance.node.address != node_addr {
                    return self.make_record_from_ip(dc, ip, instance, qname, qtype, ttl);
                }
                return self
                    .make_record_from_service_node(dc, instance, ip, qname, qtype, ttl, max_recursion)
                    .await;
            }
            return self
                .make_record_from_fqdn(dc, &node_addr, instance, qname, qtype, ttl, max_recursion)
                .await;
        }

        if let Some(ip) = service_ip {
            return self.make_record_from_ip(dc, ip, instance, qname, qtype, ttl);
        }

        if fqdn(&service_addr) == qname {
            if let Some(ip) = node_ip {
                return self
                    .make_record_from_service_node(dc, instance, ip, qname, qtype, ttl, max_recursion)
                    .await;
            }
        }

        self.make_record_from_fqdn(dc, &service_addr, instance, qname, qtype, ttl, max_recursion)
            .await
    }

    /// Node address as a record set: an address record when the address is
    /// an IP, otherwise a CNAME plus whatever the chain resolves to.
    pub(crate) async fn make_record_from_node(
        &self,
        node: &Node,
        qtype: RecordType,
        qname: &str,
        ttl: Duration,
        max_recursion: usize,
    ) -> Vec<Record> {
        let addr = self.translator.translate_node_address(
            &node.datacenter,
            &node.address,
            &node.tagged_addresses,
        );
        let ttl_secs = ttl.as_secs() as u32;

        match addr.parse::<IpAddr>() {
            Ok(ip) => {
                let Some(owner) = parse_name(qname) else {
                    return Vec::new();
                };
                make_ip_record(qtype, ip, &owner, ttl_secs)
                    .into_iter()
                    .collect()
            }
            Err(_) => {
                let mut res = Vec::new();
                let target = fqdn(&node.address);
                if let (Some(owner), Some(target_name)) = (parse_name(qname), parse_name(&target))
                {
                    res.push(Record::from_rdata(
                        owner,
                        ttl_secs,
                        RData::CNAME(CNAME(target_name)),
                    ));
                }
                res.extend(self.resolve_cname(&target, max_recursion).await);
                res
            }
        }
    }

    fn make_record_from_ip(
        &self,
        dc: &str,
        ip: IpAddr,
        instance: &CheckServiceInstance,
        qname: &str,
        qtype: RecordType,
        ttl: Duration,
    ) -> (Vec<Record>, Vec<Record>) {
        let ttl_secs = ttl.as_secs() as u32;

        if qtype == RecordType::SRV {
            // The address travels in the SRV target name; the matching
            // address record rides along as glue.
            let ip_fqdn = self.encode_ip_as_fqdn(dc, ip, qname);
            let (Some(owner), Some(target)) = (parse_name(qname), parse_name(&ip_fqdn)) else {
                return (Vec::new(), Vec::new());
            };
            let answers = vec![self.make_srv_record(dc, owner, target.clone(), instance, ttl_secs)];
            let extra = make_ip_record(RecordType::ANY, ip, &target, ttl_secs)
                .into_iter()
                .collect();
            return (answers, extra);
        }

        let Some(owner) = parse_name(qname) else {
            return (Vec::new(), Vec::new());
        };
        (
            make_ip_record(qtype, ip, &owner, ttl_secs)
                .into_iter()
                .collect(),
            Vec::new(),
        )
    }

    async fn make_record_from_service_node(
        &self,
        dc: &str,
        instance: &CheckServiceInstance,
        ip: IpAddr,
        qname: &str,
        qtype: RecordType,
        ttl: Duration,
        max_recursion: usize,
    ) -> (Vec<Record>, Vec<Record>) {
        let ttl_secs = ttl.as_secs() as u32;

        if qtype == RecordType::SRV {
            let node_fqdn = node_canonical_name(&instance.node, self.response_domain(qname));
            let (Some(owner), Some(target)) = (parse_name(qname), parse_name(&node_fqdn)) else {
                return (Vec::new(), Vec::new());
            };
            let answers = vec![self.make_srv_record(dc, owner, target, instance, ttl_secs)];
            let extra = self
                .make_record_from_node(&instance.node, RecordType::ANY, &node_fqdn, ttl, max_recursion)
                .await;
            return (answers, extra);
        }

        let Some(owner) = parse_name(qname) else {
            return (Vec::new(), Vec::new());
        };
        (
            make_ip_record(qtype, ip, &owner, ttl_secs)
                .into_iter()
                .collect(),
            Vec::new(),
        )
    }

    /// External or chained hostname: CNAME to it and chase the chain for
    /// useful address records.
    async fn make_record_from_fqdn(
        &self,
        dc: &str,
        target_host: &str,
        instance: &CheckServiceInstance,
        qname: &str,
        qtype: RecordType,
        ttl: Duration,
        max_recursion: usize,
    ) -> (Vec<Record>, Vec<Record>) {
        let ttl_secs = ttl.as_secs() as u32;
        let target = fqdn(target_host);

        let more = self.resolve_cname(&target, max_recursion).await;
        let mut additional = Vec::new();
        for mut rr in more {
            match rr.record_type() {
                RecordType::CNAME | RecordType::A | RecordType::AAAA => {
                    rr.set_ttl(ttl_secs);
                    additional.push(rr);
                    if additional.len() == MAX_RECURSE_RECORDS && !self.has_edns {
                        break;
                    }
                }
                _ => {}
            }
        }

        if qtype == RecordType::SRV {
            let (Some(owner), Some(target_name)) = (parse_name(qname), parse_name(&target)) else {
                return (Vec::new(), Vec::new());
            };
            let answers = vec![self.make_srv_record(dc, owner, target_name, instance, ttl_secs)];
            return (answers, additional);
        }

        let (Some(owner), Some(cname_target)) = (parse_name(qname), parse_name(&target)) else {
            return (Vec::new(), Vec::new());
        };
        let mut answers = vec![Record::from_rdata(
            owner,
            ttl_secs,
            RData::CNAME(CNAME(cname_target)),
        )];
        answers.extend(additional);
        (answers, Vec::new())
    }

    fn make_srv_record(
        &self,
        dc: &str,
        owner: Name,
        target: Name,
        instance: &CheckServiceInstance,
        ttl_secs: u32,
    ) -> Record {
        let port = self.translator.translate_service_port(
            dc,
            instance.service.port,
            &instance.service.tagged_addresses,
        );
        Record::from_rdata(
            owner,
            ttl_secs,
            RData::SRV(SRV::new(1, instance.srv_weight(), port, target)),
        )
    }

    /// Resolves a CNAME target: names under a served domain re-enter the
    /// dispatcher, everything else goes to the recursors.
    pub(crate) async fn resolve_cname(&self, target: &str, max_recursion: usize) -> Vec<Record> {
        let lower = target.to_ascii_lowercase();
        if self.in_domain(&lower) {
            if max_recursion < 1 {
                error!(
                    name = %target,
                    "infinite recursion detected, skipping CNAME resolution"
                );
                return Vec::new();
            }
            let mut sub = ResponseMessage::internal();
            if let Err(e) = self
                .dispatch_boxed(&lower, RecordType::ANY, None, &mut sub, max_recursion - 1)
                .await
            {
                debug!(name = %target, error = %e, "CNAME chain lookup failed");
            }
            return sub.answers;
        }

        let Some(recursor) = &self.recursor else {
            return Vec::new();
        };
        recursor.resolve_a(&lower).await
    }

    /// `<hex-ip>.addr.<dc>.<domain>` form of an address, used as the SRV
    /// target when an instance advertises an address with no name of its
    /// own.
    fn encode_ip_as_fqdn(&self, dc: &str, ip: IpAddr, qname: &str) -> String {
        let domain = self.response_domain(qname);
        let hex = match ip {
            IpAddr::V4(v4) => hex_string(&v4.octets()),
            IpAddr::V6(v6) => hex_string(&v6.octets()),
        };
        format!("{hex}.addr.{dc}.{domain}")
    }
}

/// `<node>.node.<dc>.<domain>`, lowercased FQDN.
pub(crate) fn node_canonical_name(node: &Node, domain: &str) -> String {
    fqdn(&format!("{}.node.{}.{}", node.name, node.datacenter, domain))
}

/// Address record gated by the question type: A for IPv4 unless the
/// client asked only for AAAA, and vice versa. SRV, NS and TXT questions
/// accept either family (the record lands in the additional section).
pub(crate) fn make_ip_record(
    qtype: RecordType,
    ip: IpAddr,
    owner: &Name,
    ttl_secs: u32,
) -> Option<Record> {
    match ip {
        IpAddr::V4(v4)
            if matches!(
                qtype,
                RecordType::A
                    | RecordType::ANY
                    | RecordType::SRV
                    | RecordType::NS
                    | RecordType::TXT
            ) =>
        {
            Some(Record::from_rdata(owner.clone(), ttl_secs, RData::A(A(v4))))
        }
        IpAddr::V6(v6)
            if matches!(
                qtype,
                RecordType::AAAA
                    | RecordType::ANY
                    | RecordType::SRV
                    | RecordType::NS
                    | RecordType::TXT
            ) =>
        {
            Some(Record::from_rdata(
                owner.clone(),
                ttl_secs,
                RData::AAAA(AAAA(v6)),
            ))
        }
        _ => None,
    }
}

/// Node metadata as TXT records. Values are `key=value` encoded per
/// RFC 1464 unless the key carries the `rfc1035-` prefix, which passes
/// the value through raw.
pub(crate) fn generate_meta(owner: &str, node: &Node, ttl: Duration) -> Vec<Record> {
    let Some(owner) = parse_name(owner) else {
        return Vec::new();
    };
    let ttl_secs = ttl.as_secs() as u32;
    node.meta
        .iter()
        .map(|(key, value)| {
            let txt = if key.to_ascii_lowercase().starts_with("rfc1035-") {
                value.clone()
            } else {
                encode_kv_rfc1464(key, value)
            };
            Record::from_rdata(owner.clone(), ttl_secs, RData::TXT(TXT::new(vec![txt])))
        })
        .collect()
}

/// RFC 1464 attribute encoding: backquote-escape backquotes, equals
/// signs and the leading/trailing spaces of the key.
pub(crate) fn encode_kv_rfc1464(key: &str, value: &str) -> String {
    let escaped = key.replace('`', "``").replace('=', "`=");

    let leading = escaped.len() - escaped.trim_start_matches(' ').len();
    let trailing = escaped.trim_start_matches(' ').len()
        - escaped.trim_start_matches(' ').trim_end_matches(' ').len();
    let core = escaped.trim_matches(' ');

    let mut out = String::with_capacity(escaped.len() + value.len() + 1);
    for _ in 0..leading {
        out.push_str("` ");
    }
    out.push_str(core);
    for _ in 0..trailing {
        out.push_str("` ");
    }
    out.push('=');
    out.push_str(&value.replace('`', "``"));
    out
}

pub(crate) fn parse_name(s: &str) -> Option<Name> {
    match Name::from_utf8(s) {
        Ok(name) => Some(name),
        Err(e) => {
            warn!(name = %s, error = %e, "invalid DNS name");
            None
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((b & 0xF) as u32, 16).unwrap_or('0'));
    }
    out
}

pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some(((hi << 4) | lo) as u8)
        })
        .collect()
}
