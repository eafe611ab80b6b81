//! The DNS responder.
//!
//! One [`DnsServer`] is shared by every listener task. A request captures
//! the current configuration snapshot, builds a [`QueryEngine`] around it
//! and routes on the question name: reverse zones, the served domains, or
//! out to the recursors.

use crate::dns::dispatch::{QueryEngine, MAX_RECURSION_LEVEL_DEFAULT};
use crate::dns::message::{rcode_from_error, ResponseMessage, Transport};
use crate::dns::recurse::RecursorClient;
use crate::dns::{edns, trim, wire};
use arc_swap::{ArcSwap, ArcSwapOption};
use corral_dns_application::ports::AddressTranslator;
use corral_dns_application::CatalogReader;
use corral_dns_domain::config::fqdn;
use corral_dns_domain::{DnsConfig, DnsError, DnsRuntimeConfig};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::BinDecodable;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct DnsServer {
    cfg: ArcSwap<DnsRuntimeConfig>,
    recursor: ArcSwapOption<RecursorClient>,
    recursor_enabled: AtomicBool,
    reader: Arc<CatalogReader>,
    translator: Arc<dyn AddressTranslator>,
}

impl DnsServer {
    pub fn new(
        config: &DnsConfig,
        reader: Arc<CatalogReader>,
        translator: Arc<dyn AddressTranslator>,
    ) -> Result<Self, DnsError> {
        let rt = DnsRuntimeConfig::compile(config)?;
        let recursor = build_recursor(&rt);
        let enabled = recursor.is_some();
        Ok(Self {
            cfg: ArcSwap::from_pointee(rt),
            recursor: ArcSwapOption::from(recursor),
            recursor_enabled: AtomicBool::new(enabled),
            reader,
            translator,
        })
    }

    pub fn config(&self) -> Arc<DnsRuntimeConfig> {
        self.cfg.load_full()
    }

    /// Swaps in a freshly compiled snapshot. In-flight requests keep the
    /// snapshot they started with.
    pub fn reload(&self, config: &DnsConfig) -> Result<(), DnsError> {
        let rt = DnsRuntimeConfig::compile(config)?;
        let recursor = build_recursor(&rt);
        let enable = recursor.is_some();
        self.recursor.store(recursor);
        if self
            .recursor_enabled
            .compare_exchange(!enable, enable, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if enable {
                info!("recursors enabled");
            } else {
                info!("recursors disabled");
            }
        }
        self.cfg.store(Arc::new(rt));
        Ok(())
    }

    /// Handles one request datagram/frame and returns the response bytes.
    /// `None` means there is nothing sensible to send back.
    pub async fn handle(
        &self,
        buf: &[u8],
        transport: Transport,
        src: SocketAddr,
    ) -> Option<Vec<u8>> {
        let start = Instant::now();
        let cfg = self.cfg.load_full();

        let req = match Message::from_bytes(buf) {
            Ok(req) => req,
            Err(e) => {
                warn!(client = %src, error = %e, "failed to decode request");
                return formerr_for(buf);
            }
        };
        let question = match req.queries().first() {
            Some(q) => q.clone(),
            None => {
                warn!(client = %src, "request carries no question");
                return formerr_for(buf);
            }
        };
        let qname = fqdn(&question.name().to_utf8());
        let qtype = question.query_type();

        let engine = QueryEngine {
            cfg: Arc::clone(&cfg),
            reader: Arc::clone(&self.reader),
            translator: Arc::clone(&self.translator),
            recursor: self.recursor.load_full(),
            has_edns: req.extensions().is_some(),
        };

        let bytes = if qname.ends_with(".in-addr.arpa.") || qname.ends_with(".ip6.arpa.") {
            self.handle_ptr_request(&engine, &cfg, buf, &req, &qname, transport)
                .await
        } else if engine.in_domain(&qname) {
            self.handle_query(&engine, &cfg, &req, &qname, qtype, transport, src)
                .await
        } else {
            self.handle_recurse(&cfg, buf, &req, transport).await
        };

        debug!(
            question = %qname,
            qtype = %qtype,
            network = transport.as_str(),
            client = %src,
            latency = ?start.elapsed(),
            "request served"
        );
        Some(bytes)
    }

    async fn handle_query(
        &self,
        engine: &QueryEngine,
        cfg: &DnsRuntimeConfig,
        req: &Message,
        qname: &str,
        qtype: RecordType,
        transport: Transport,
        src: SocketAddr,
    ) -> Vec<u8> {
        let mut resp = ResponseMessage::reply(
            req,
            !cfg.disable_compression,
            self.recursor_enabled.load(Ordering::SeqCst),
        );

        match qtype {
            RecordType::SOA => {
                if let Some(soa) = engine.soa_record(qname) {
                    resp.answers.push(soa);
                }
                let (ns, glue) = engine.nameservers(qname, MAX_RECURSION_LEVEL_DEFAULT).await;
                resp.authorities = ns;
                resp.extras = glue;
            }
            RecordType::NS => {
                let (ns, glue) = engine.nameservers(qname, MAX_RECURSION_LEVEL_DEFAULT).await;
                resp.answers = ns;
                resp.extras = glue;
            }
            RecordType::AXFR => {
                resp.rcode = ResponseCode::NotImp;
            }
            _ => {
                match engine
                    .dispatch(
                        qname,
                        qtype,
                        Some(src.ip()),
                        &mut resp,
                        MAX_RECURSION_LEVEL_DEFAULT,
                    )
                    .await
                {
                    Ok(()) => {
                        // Name exists but nothing matched the question
                        // type; the SOA marks the negative answer.
                        if resp.answers.is_empty() {
                            engine.add_soa(&mut resp, qname);
                        }
                    }
                    Err(e) => {
                        resp.rcode = rcode_from_error(Some(&e));
                        match e {
                            DnsError::NameNotFound | DnsError::NoData => {
                                engine.add_soa(&mut resp, qname);
                            }
                            e => error!(question = %qname, error = %e, "lookup failed"),
                        }
                    }
                }
            }
        }

        edns::apply_edns(&mut resp, req);
        trim::trim_response(cfg, transport, req, &mut resp);
        wire::encode(&resp)
    }

    async fn handle_ptr_request(
        &self,
        engine: &QueryEngine,
        cfg: &DnsRuntimeConfig,
        buf: &[u8],
        req: &Message,
        qname: &str,
        transport: Transport,
    ) -> Vec<u8> {
        let mut resp = ResponseMessage::reply(
            req,
            !cfg.disable_compression,
            self.recursor_enabled.load(Ordering::SeqCst),
        );
        // A SOA question on the reverse zone is answered with our SOA.
        if req
            .queries()
            .first()
            .is_some_and(|q| q.query_type() == RecordType::SOA)
        {
            engine.add_soa(&mut resp, qname);
        }
        engine.handle_ptr(qname, &mut resp).await;

        if resp.answers.is_empty() {
            return self.handle_recurse(cfg, buf, req, transport).await;
        }

        // Reverse answers are never subnet-specific and never trimmed.
        edns::apply_edns(&mut resp, req);
        wire::encode(&resp)
    }

    async fn handle_recurse(
        &self,
        cfg: &DnsRuntimeConfig,
        buf: &[u8],
        req: &Message,
        transport: Transport,
    ) -> Vec<u8> {
        if let Some(recursor) = self.recursor.load_full() {
            if let Some(reply) = recursor.forward(buf, transport).await {
                return reply;
            }
            error!(
                question = ?req.queries().first().map(|q| q.name().to_utf8()),
                "all recursors failed"
            );
        }

        let mut resp = ResponseMessage::reply(req, !cfg.disable_compression, true);
        resp.rcode = ResponseCode::ServFail;
        edns::apply_edns(&mut resp, req);
        wire::encode(&resp)
    }
}

fn build_recursor(cfg: &DnsRuntimeConfig) -> Option<Arc<RecursorClient>> {
    if cfg.recursors_enabled() {
        Some(Arc::new(RecursorClient::new(
            cfg.recursors.clone(),
            cfg.recursor_timeout,
        )))
    } else {
        None
    }
}

/// Minimal FORMERR reply echoing the request id, when there is enough of
/// a header to echo.
fn formerr_for(buf: &[u8]) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let mut resp = ResponseMessage::internal();
    resp.id = u16::from_be_bytes([buf[0], buf[1]]);
    resp.rcode = ResponseCode::FormErr;
    resp.authoritative = false;
    Some(wire::encode(&resp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formerr_echoes_id() {
        let reply = formerr_for(&[0xAB, 0xCD, 0, 0]).unwrap();
        assert_eq!(&reply[0..2], &[0xAB, 0xCD]);
        assert_eq!(reply[3] & 0x0F, 1); // FORMERR
        assert!(formerr_for(&[0x01]).is_none());
    }
}
