//! Response size governor.
//!
//! UDP responses are first cut to a fixed answer count (non-EDNS clients
//! only), then shrunk until the serialized size fits the client's limit.
//! TCP responses get a generous pre-cap and the 64k protocol ceiling.
//! Additional records are kept in sync with the surviving SRV targets
//! after every cut.

use crate::dns::message::{ResponseMessage, Transport};
use corral_dns_domain::DnsRuntimeConfig;
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record, RecordType};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::dns::edns;
use crate::dns::wire;

/// Classic DNS UDP payload limit.
const DEFAULT_MAX_UDP_SIZE: usize = 512;
/// Largest UDP datagram we are willing to build, EDNS or not; the
/// advertised payload is clamped to it.
const MAX_UDP_DATAGRAM_SIZE: usize = u16::MAX as usize - 68;
/// Hard ceiling on the non-EDNS UDP answer count; the configured limit
/// cannot raise it.
const MAX_UDP_ANSWER_LIMIT: usize = 8;
/// 64k minus the raw message overhead.
const MAX_TCP_SIZE: usize = 65523;
/// UDP headroom subtracted from the size limit.
const UDP_HEADER_MARGIN: usize = 8;

/// Trims `resp` in place for the transport; sets the TC bit only when
/// truncation happened and the configuration asks for it.
pub fn trim_response(
    cfg: &DnsRuntimeConfig,
    transport: Transport,
    req: &Message,
    resp: &mut ResponseMessage,
) {
    let original_size = wire::encoded_len(resp);
    let original_records = resp.answers.len();

    let trimmed = match transport {
        Transport::Udp => trim_udp(cfg, req, resp),
        Transport::Tcp => trim_tcp(req, resp),
    };

    if trimmed {
        if cfg.enable_truncate {
            resp.truncated = true;
        }
        debug!(
            network = transport.as_str(),
            total_records = original_records,
            returned_records = resp.answers.len(),
            total_bytes = original_size,
            sent_bytes = wire::encoded_len(resp),
            "answer too large, truncated"
        );
    }
}

fn trim_udp(cfg: &DnsRuntimeConfig, req: &Message, resp: &mut ResponseMessage) -> bool {
    let num_answers = resp.answers.len();
    let has_extra = !resp.extras.is_empty();

    let mut max_size = DEFAULT_MAX_UDP_SIZE;
    if let Some(payload) = edns::max_payload(req) {
        max_size = max_size.max(payload as usize);
    }
    max_size = max_size.min(MAX_UDP_DATAGRAM_SIZE);

    let index = if has_extra {
        index_rrs(&resp.extras)
    } else {
        FxHashMap::default()
    };

    // Cut plain 512-byte clients to a useful answer count up front. The
    // size loop below measures uncompressed for them, so a compliant
    // response stays compliant even if a forwarder re-expands it.
    let max_answers = MAX_UDP_ANSWER_LIMIT.min(cfg.udp_answer_limit);
    let compress = resp.compress;
    if max_size == DEFAULT_MAX_UDP_SIZE && num_answers > max_answers {
        resp.compress = false;
        resp.answers.truncate(max_answers);
        if has_extra {
            sync_extra(&index, resp);
        }
    }

    while resp.answers.len() > 1 && wire::encoded_len(resp) > max_size - UDP_HEADER_MARGIN {
        // Dropping the authority section may be all it takes.
        if !resp.authorities.is_empty() {
            resp.authorities.clear();
        }
        if wire::encoded_len(resp).saturating_sub(max_size) > 100 {
            let best = binary_truncate(resp, max_size, &index, has_extra);
            resp.answers.truncate(best);
        } else {
            resp.answers.pop();
        }
        if has_extra {
            sync_extra(&index, resp);
        }
    }
    resp.compress = compress;

    resp.answers.len() < num_answers
}

fn trim_tcp(req: &Message, resp: &mut ResponseMessage) -> bool {
    let has_extra = !resp.extras.is_empty();

    // Even compressed, more than this many records cannot fit in 64k;
    // pre-capping keeps the search cheap.
    let truncate_at = if req
        .queries()
        .first()
        .is_some_and(|q| q.query_type() == RecordType::SRV)
    {
        1024
    } else {
        4096
    };
    if resp.answers.len() > truncate_at {
        resp.answers.truncate(truncate_at);
    }

    let index = if has_extra {
        index_rrs(&resp.extras)
    } else {
        FxHashMap::default()
    };
    let mut truncated = false;

    while resp.answers.len() > 1 && wire::encoded_len(resp) > MAX_TCP_SIZE {
        truncated = true;
        // Dropping the authority section may be all it takes.
        if !resp.authorities.is_empty() {
            resp.authorities.clear();
        }
        if wire::encoded_len(resp).saturating_sub(MAX_TCP_SIZE) > 100 {
            let best = binary_truncate(resp, MAX_TCP_SIZE, &index, has_extra);
            resp.answers.truncate(best);
        } else {
            resp.answers.pop();
        }
        if has_extra {
            sync_extra(&index, resp);
        }
    }

    truncated
}

/// Largest answer prefix that fits in `max_size`, found by binary search.
/// Accepts a fit more than 10 bytes under the limit as final; growing the
/// prefix from there would overshoot.
fn binary_truncate(
    resp: &mut ResponseMessage,
    max_size: usize,
    index: &FxHashMap<String, Record>,
    has_extra: bool,
) -> usize {
    let original = resp.answers.clone();
    let mut start = 0usize;
    let mut end = original.len() + 1;
    let mut best = 0usize;
    while end - start > 1 {
        let median = start + (end - start) / 2;
        resp.answers = original[..median].to_vec();
        if has_extra {
            sync_extra(index, resp);
        }
        let len = wire::encoded_len(resp);
        if len <= max_size {
            if max_size - len < 10 {
                best = median;
                break;
            }
            start = median;
            best = median;
        } else {
            end = median;
        }
    }
    resp.answers = original;
    if best == 0 {
        start
    } else {
        best
    }
}

/// First record per lowercased owner name.
fn index_rrs(rrs: &[Record]) -> FxHashMap<String, Record> {
    let mut index = FxHashMap::default();
    for rr in rrs {
        let name = rr.name().to_string().to_ascii_lowercase();
        index.entry(name).or_insert_with(|| rr.clone());
    }
    index
}

/// Rebuilds the additional section to cover exactly the SRV targets still
/// present in the answers, following CNAME hops within the section.
fn sync_extra(index: &FxHashMap<String, Record>, resp: &mut ResponseMessage) {
    let mut extra = Vec::with_capacity(resp.answers.len());
    let mut resolved: FxHashSet<String> = FxHashSet::default();
    for rr in &resp.answers {
        let RData::SRV(srv) = rr.data() else {
            continue;
        };
        let mut target = srv.target().to_string().to_ascii_lowercase();
        loop {
            if !resolved.insert(target.clone()) {
                break;
            }
            let Some(extra_rr) = index.get(&target) else {
                break;
            };
            extra.push(extra_rr.clone());
            if let RData::CNAME(cname) = extra_rr.data() {
                target = cname.0.to_string().to_ascii_lowercase();
            } else {
                break;
            }
        }
    }
    resp.extras = extra;
}
