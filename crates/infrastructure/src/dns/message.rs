//! Response message model.
//!
//! The engine assembles answers into [`ResponseMessage`] rather than a
//! hickory `Message` so the size governor can slice the answer section and
//! re-measure without fighting an encoder that always compresses. The
//! final bytes come from [`crate::dns::wire::encode`].

use corral_dns_domain::DnsError;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::Record;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// EDNS Client Subnet option, echoed back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsOption {
    pub address: IpAddr,
    pub source_prefix: u8,
    pub scope_prefix: u8,
}

/// EDNS0 data attached to a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEdns {
    pub max_payload: u16,
    pub subnet: Option<EcsOption>,
}

/// A response under construction: sections are plain vectors the trimming
/// pass can cut and re-measure freely.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub id: u16,
    pub rcode: ResponseCode,
    pub authoritative: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub truncated: bool,
    /// Name compression on the final encode; temporarily cleared while
    /// the size governor measures.
    pub compress: bool,
    pub question: Option<Query>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub extras: Vec<Record>,
    pub edns: Option<ResponseEdns>,
    /// Whether the answer is valid for any client subnet. Prepared-query
    /// answers may be locality-sorted and clear this.
    pub ecs_global: bool,
}

impl ResponseMessage {
    /// Starts a reply mirroring the request id, question and RD flag.
    pub fn reply(req: &Message, compress: bool, recursion_available: bool) -> Self {
        Self {
            id: req.id(),
            rcode: ResponseCode::NoError,
            authoritative: true,
            recursion_desired: req.recursion_desired(),
            recursion_available,
            truncated: false,
            compress,
            question: req.queries().first().cloned(),
            answers: Vec::new(),
            authorities: Vec::new(),
            extras: Vec::new(),
            edns: None,
            ecs_global: true,
        }
    }

    /// Scratch message for internal re-entrant lookups; only the answer
    /// section is ever read back.
    pub fn internal() -> Self {
        Self {
            id: 0,
            rcode: ResponseCode::NoError,
            authoritative: true,
            recursion_desired: false,
            recursion_available: false,
            truncated: false,
            compress: true,
            question: None,
            answers: Vec::new(),
            authorities: Vec::new(),
            extras: Vec::new(),
            edns: None,
            ecs_global: true,
        }
    }
}

/// DNS response code for a lookup outcome. NODATA maps to NOERROR per
/// RFC 2308 (the SOA added by the caller marks the negative answer).
pub fn rcode_from_error(err: Option<&DnsError>) -> ResponseCode {
    match err {
        None => ResponseCode::NoError,
        Some(DnsError::NoData) => ResponseCode::NoError,
        Some(DnsError::NameNotFound) => ResponseCode::NXDomain,
        Some(_) => ResponseCode::ServFail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcode_mapping() {
        assert_eq!(rcode_from_error(None), ResponseCode::NoError);
        assert_eq!(
            rcode_from_error(Some(&DnsError::NoData)),
            ResponseCode::NoError
        );
        assert_eq!(
            rcode_from_error(Some(&DnsError::NameNotFound)),
            ResponseCode::NXDomain
        );
        assert_eq!(
            rcode_from_error(Some(&DnsError::Rpc("boom".into()))),
            ResponseCode::ServFail
        );
    }
}
