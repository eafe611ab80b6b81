//! EDNS0 handling: payload size negotiation and Client Subnet echo.

use crate::dns::message::{EcsOption, ResponseEdns, ResponseMessage};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsCode;
use hickory_proto::serialize::binary::BinEncodable;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Floor for an advertised EDNS payload; anything smaller is treated as
/// the classic UDP limit.
const MIN_EDNS_PAYLOAD: u16 = 512;

/// Extracts the Client Subnet option from an inbound request, if present.
/// The option payload is parsed from its RFC 7871 wire form.
pub fn subnet_from_request(req: &Message) -> Option<EcsOption> {
    let edns = req.extensions().as_ref()?;
    let option = edns.option(EdnsCode::Subnet)?;
    let data = match option.to_bytes() {
        Ok(data) => data,
        Err(e) => {
            debug!(error = %e, "unreadable client subnet option");
            return None;
        }
    };
    parse_subnet_payload(&data)
}

fn parse_subnet_payload(data: &[u8]) -> Option<EcsOption> {
    if data.len() < 4 {
        return None;
    }
    let family = u16::from_be_bytes([data[0], data[1]]);
    let source_prefix = data[2];
    let scope_prefix = data[3];
    let addr_bytes = &data[4..];
    let expect = (usize::from(source_prefix) + 7) / 8;
    if addr_bytes.len() < expect {
        return None;
    }
    let address = match family {
        1 => {
            if expect > 4 {
                return None;
            }
            let mut octets = [0u8; 4];
            octets[..expect].copy_from_slice(&addr_bytes[..expect]);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        2 => {
            if expect > 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets[..expect].copy_from_slice(&addr_bytes[..expect]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(EcsOption {
        address,
        source_prefix,
        scope_prefix,
    })
}

/// Advertised payload size for the request, or `None` without EDNS.
pub fn max_payload(req: &Message) -> Option<u16> {
    req.extensions()
        .as_ref()
        .map(|edns| edns.max_payload().max(MIN_EDNS_PAYLOAD))
}

/// Mirrors the request's EDNS block onto the response.
///
/// The Client Subnet scope is 0 when the answer holds for any subnet
/// (or on an error rcode, where scope is meaningless); otherwise the
/// source prefix is echoed to mark a subnet-specific answer.
pub fn apply_edns(resp: &mut ResponseMessage, req: &Message) {
    let Some(payload) = max_payload(req) else {
        return;
    };

    let subnet = subnet_from_request(req).map(|mut ecs| {
        let ok_rcode =
            resp.rcode == ResponseCode::NoError || resp.rcode == ResponseCode::NXDomain;
        ecs.scope_prefix = if resp.ecs_global || !ok_rcode {
            0
        } else {
            ecs.source_prefix
        };
        ecs
    });

    resp.edns = Some(ResponseEdns {
        max_payload: payload,
        subnet,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Edns, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::opt::EdnsOption;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn ecs_payload(addr: [u8; 4], source_prefix: u8) -> Vec<u8> {
        let take = (usize::from(source_prefix) + 7) / 8;
        let mut data = vec![0, 1, source_prefix, 0];
        data.extend_from_slice(&addr[..take]);
        data
    }

    fn request_with_ecs(source_prefix: u8) -> Message {
        let mut req = Message::new(7, MessageType::Query, OpCode::Query);
        req.add_query(Query::query(
            Name::from_str("db.service.corral.").unwrap(),
            RecordType::A,
        ));
        let mut edns = Edns::new();
        edns.set_max_payload(1280);
        edns.options_mut().insert(EdnsOption::Unknown(
            8,
            ecs_payload([10, 1, 2, 0], source_prefix),
        ));
        req.set_edns(edns);
        req
    }

    #[test]
    fn no_edns_means_no_opt() {
        let mut req = Message::new(1, MessageType::Query, OpCode::Query);
        let mut resp = ResponseMessage::reply(&req, true, false);
        apply_edns(&mut resp, &req);
        assert!(resp.edns.is_none());
    }

    #[test]
    fn subnet_payload_parses() {
        let ecs = parse_subnet_payload(&ecs_payload([10, 1, 2, 0], 24)).unwrap();
        assert_eq!(ecs.address, "10.1.2.0".parse::<IpAddr>().unwrap());
        assert_eq!(ecs.source_prefix, 24);
        assert_eq!(ecs.scope_prefix, 0);

        // Truncated address bytes are rejected.
        assert!(parse_subnet_payload(&[0, 1, 24, 0, 10]).is_none());
        // Unknown family is rejected.
        assert!(parse_subnet_payload(&[0, 9, 8, 0, 10]).is_none());
    }

    #[test]
    fn global_answer_echoes_scope_zero() {
        let req = request_with_ecs(24);
        let mut resp = ResponseMessage::reply(&req, true, false);
        apply_edns(&mut resp, &req);
        let edns = resp.edns.expect("edns expected");
        assert_eq!(edns.max_payload, 1280);
        assert_eq!(edns.subnet.unwrap().scope_prefix, 0);
    }

    #[test]
    fn subnet_specific_answer_echoes_source_prefix() {
        let req = request_with_ecs(24);
        let mut resp = ResponseMessage::reply(&req, true, false);
        resp.ecs_global = false;
        apply_edns(&mut resp, &req);
        assert_eq!(resp.edns.unwrap().subnet.unwrap().scope_prefix, 24);
    }

    #[test]
    fn error_rcode_forces_scope_zero() {
        let req = request_with_ecs(24);
        let mut resp = ResponseMessage::reply(&req, true, false);
        resp.ecs_global = false;
        resp.rcode = ResponseCode::ServFail;
        apply_edns(&mut resp, &req);
        assert_eq!(resp.edns.unwrap().subnet.unwrap().scope_prefix, 0);
    }

    #[test]
    fn tiny_advertised_payload_is_clamped() {
        let mut req = Message::new(2, MessageType::Query, OpCode::Query);
        let mut edns = Edns::new();
        edns.set_max_payload(100);
        req.set_edns(edns);
        assert_eq!(max_payload(&req), Some(512));
    }
}
