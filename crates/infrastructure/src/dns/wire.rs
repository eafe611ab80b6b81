//! DNS response serialization.
//!
//! Hand-rolled for two reasons the stock encoders cannot cover: the size
//! governor needs exact serialized sizes with compression switched off
//! (a compressed length is meaningless as a conservative bound), and the
//! compression flag is part of the server configuration. Inbound queries
//! and recursor replies are still decoded with hickory.

use crate::dns::message::{EcsOption, ResponseMessage};
use hickory_proto::op::Query;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustc_hash::FxHashMap;
use std::net::IpAddr;

const CLASS_IN: u16 = 1;
const TYPE_OPT: u16 = 41;
const ECS_OPTION_CODE: u16 = 8;
/// Pointers only address the first 14 bits of offset.
const MAX_POINTER_OFFSET: usize = 0x3FFF;

/// Serializes a response message. Compression is applied when
/// `resp.compress` is set; measurement passes clear it first.
pub fn encode(resp: &ResponseMessage) -> Vec<u8> {
    let mut enc = Encoder {
        buf: Vec::with_capacity(512),
        pointers: FxHashMap::default(),
        compress: resp.compress,
    };

    let answers: Vec<&Record> = resp.answers.iter().filter(|r| supported(r)).collect();
    let authorities: Vec<&Record> = resp.authorities.iter().filter(|r| supported(r)).collect();
    let extras: Vec<&Record> = resp.extras.iter().filter(|r| supported(r)).collect();

    let qdcount = resp.question.iter().count() as u16;
    let arcount = extras.len() as u16 + u16::from(resp.edns.is_some());

    enc.emit_u16(resp.id);
    let mut flags_hi = 0x80u8; // QR
    if resp.authoritative {
        flags_hi |= 0x04;
    }
    if resp.truncated {
        flags_hi |= 0x02;
    }
    if resp.recursion_desired {
        flags_hi |= 0x01;
    }
    let mut flags_lo = resp.rcode.low() & 0x0F;
    if resp.recursion_available {
        flags_lo |= 0x80;
    }
    enc.buf.push(flags_hi);
    enc.buf.push(flags_lo);
    enc.emit_u16(qdcount);
    enc.emit_u16(answers.len() as u16);
    enc.emit_u16(authorities.len() as u16);
    enc.emit_u16(arcount);

    if let Some(q) = &resp.question {
        enc.emit_question(q);
    }
    for rr in answers {
        enc.emit_record(rr);
    }
    for rr in authorities {
        enc.emit_record(rr);
    }
    for rr in extras {
        enc.emit_record(rr);
    }
    if let Some(edns) = &resp.edns {
        enc.emit_opt(edns.max_payload, edns.subnet.as_ref());
    }

    enc.buf
}

/// Serialized size of the message as currently assembled.
pub fn encoded_len(resp: &ResponseMessage) -> usize {
    encode(resp).len()
}

/// Record types this encoder knows how to emit; everything the synthesis
/// engine produces.
fn supported(rr: &Record) -> bool {
    matches!(
        rr.record_type(),
        RecordType::A
            | RecordType::AAAA
            | RecordType::CNAME
            | RecordType::NS
            | RecordType::PTR
            | RecordType::SOA
            | RecordType::SRV
            | RecordType::TXT
    )
}

struct Encoder {
    buf: Vec<u8>,
    /// Lowercased name suffix -> offset of its first occurrence.
    pointers: FxHashMap<String, u16>,
    compress: bool,
}

impl Encoder {
    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a domain name, registering suffix offsets for later pointers.
    /// `allow_pointer` is cleared for SRV targets, which RFC 2782 forbids
    /// compressing.
    fn emit_name(&mut self, name: &Name, allow_pointer: bool) {
        let labels: Vec<&[u8]> = name.iter().collect();
        for i in 0..labels.len() {
            let key = suffix_key(&labels[i..]);
            if self.compress {
                if allow_pointer {
                    if let Some(&off) = self.pointers.get(&key) {
                        self.emit_u16(0xC000 | off);
                        return;
                    }
                }
                if self.buf.len() <= MAX_POINTER_OFFSET {
                    self.pointers.entry(key).or_insert(self.buf.len() as u16);
                }
            }
            let label = labels[i];
            self.buf.push(label.len() as u8);
            self.buf.extend_from_slice(label);
        }
        self.buf.push(0);
    }

    fn emit_question(&mut self, q: &Query) {
        self.emit_name(q.name(), true);
        self.emit_u16(u16::from(q.query_type()));
        self.emit_u16(CLASS_IN);
    }

    fn emit_record(&mut self, rr: &Record) {
        self.emit_name(rr.name(), true);
        self.emit_u16(u16::from(rr.record_type()));
        self.emit_u16(CLASS_IN);
        self.emit_u32(rr.ttl());

        let rdlength_at = self.buf.len();
        self.emit_u16(0);
        let rdata_start = self.buf.len();

        match rr.data() {
            RData::A(a) => self.buf.extend_from_slice(&a.0.octets()),
            RData::AAAA(aaaa) => self.buf.extend_from_slice(&aaaa.0.octets()),
            RData::CNAME(cname) => self.emit_name(&cname.0, true),
            RData::NS(ns) => self.emit_name(&ns.0, true),
            RData::PTR(ptr) => self.emit_name(&ptr.0, true),
            RData::SOA(soa) => {
                self.emit_name(soa.mname(), true);
                self.emit_name(soa.rname(), true);
                self.emit_u32(soa.serial());
                self.emit_u32(soa.refresh() as u32);
                self.emit_u32(soa.retry() as u32);
                self.emit_u32(soa.expire() as u32);
                self.emit_u32(soa.minimum());
            }
            RData::SRV(srv) => {
                self.emit_u16(srv.priority());
                self.emit_u16(srv.weight());
                self.emit_u16(srv.port());
                self.emit_name(srv.target(), false);
            }
            RData::TXT(txt) => {
                for chunk in txt.txt_data() {
                    self.buf.push(chunk.len() as u8);
                    self.buf.extend_from_slice(chunk);
                }
            }
            // supported() keeps everything else out of the sections
            _ => {}
        }

        let rdlength = (self.buf.len() - rdata_start) as u16;
        self.buf[rdlength_at..rdlength_at + 2].copy_from_slice(&rdlength.to_be_bytes());
    }

    /// OPT pseudo-record carrying the payload size and, when present, an
    /// echoed Client Subnet option.
    fn emit_opt(&mut self, max_payload: u16, subnet: Option<&EcsOption>) {
        self.buf.push(0); // root name
        self.emit_u16(TYPE_OPT);
        self.emit_u16(max_payload);
        self.emit_u32(0); // extended rcode + version + flags

        let rdlength_at = self.buf.len();
        self.emit_u16(0);
        let rdata_start = self.buf.len();

        if let Some(ecs) = subnet {
            let addr_len = (usize::from(ecs.source_prefix) + 7) / 8;
            self.emit_u16(ECS_OPTION_CODE);
            self.emit_u16(4 + addr_len as u16);
            match ecs.address {
                IpAddr::V4(v4) => {
                    self.emit_u16(1);
                    self.buf.push(ecs.source_prefix);
                    self.buf.push(ecs.scope_prefix);
                    self.buf.extend_from_slice(&v4.octets()[..addr_len.min(4)]);
                }
                IpAddr::V6(v6) => {
                    self.emit_u16(2);
                    self.buf.push(ecs.source_prefix);
                    self.buf.push(ecs.scope_prefix);
                    self.buf.extend_from_slice(&v6.octets()[..addr_len.min(16)]);
                }
            }
        }

        let rdlength = (self.buf.len() - rdata_start) as u16;
        self.buf[rdlength_at..rdlength_at + 2].copy_from_slice(&rdlength.to_be_bytes());
    }
}

fn suffix_key(labels: &[&[u8]]) -> String {
    let mut key = String::new();
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            key.push('.');
        }
        for b in label.iter() {
            key.push(b.to_ascii_lowercase() as char);
        }
    }
    key
}
