//! End-to-end request tests: raw wire bytes in, decoded replies out,
//! backed by the in-memory catalog.

use corral_dns_application::CatalogReader;
use corral_dns_domain::catalog::{
    CheckServiceInstance, HealthCheck, HealthStatus, Node, Service, Weights,
};
use corral_dns_domain::DnsConfig;
use corral_dns_infrastructure::catalog::{
    InMemoryCatalog, PassthroughCache, PreparedQueryDef, TaggedAddressTranslator,
};
use corral_dns_infrastructure::dns::{DnsServer, Transport};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn inst(node: &str, ip: &str, service: &str, port: u16, tags: &[&str]) -> CheckServiceInstance {
    CheckServiceInstance {
        node: Node {
            name: node.into(),
            datacenter: "dc1".into(),
            address: ip.into(),
            tagged_addresses: HashMap::new(),
            meta: BTreeMap::new(),
        },
        service: Service {
            name: service.into(),
            address: String::new(),
            port,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            tagged_addresses: HashMap::new(),
            weights: Weights::default(),
            connect: false,
        },
        checks: vec![],
    }
}

fn seeded_catalog() -> Arc<InMemoryCatalog> {
    let catalog = Arc::new(InMemoryCatalog::new(Default::default()));

    let mut foo = inst("foo", "10.0.0.1", "db", 5432, &["primary"]);
    foo.node.meta.insert("rack".into(), "r1".into());
    catalog.register(foo);
    catalog.register(inst("bar", "10.0.0.2", "db", 5432, &["replica"]));

    let mut failing = inst("baz", "10.0.0.3", "db", 5432, &[]);
    failing.checks.push(HealthCheck {
        service_name: "db".into(),
        status: HealthStatus::Critical,
    });
    catalog.register(failing);

    // The cluster's own service backs NS/SOA answers.
    catalog.register(inst("foo", "10.0.0.1", "corral", 8600, &[]));
    catalog.register(inst("bar", "10.0.0.2", "corral", 8600, &[]));

    for i in 1..=6u8 {
        catalog.register(inst(&format!("w{i}"), &format!("10.0.1.{i}"), "web", 80, &[]));
    }

    let mut addressed = inst("ext", "10.0.0.9", "app", 8080, &[]);
    addressed.service.address = "192.168.7.7".into();
    catalog.register(addressed);

    let mut mesh = inst("pg1", "10.0.0.5", "pg", 5432, &[]);
    mesh.service.connect = true;
    catalog.register(mesh);
    catalog.register(inst("pg2", "10.0.0.6", "pg", 5432, &[]));

    catalog.register(inst("webserver", "web.example.com", "site", 443, &[]));

    // Remote-datacenter node with a hostname address and a wan override.
    let mut remote = inst("edge", "internal.example.com", "site2", 443, &[]);
    remote.node.datacenter = "dc2".into();
    remote
        .node
        .tagged_addresses
        .insert("wan".into(), "public.example.com".into());
    catalog.register(remote);

    catalog.register_prepared_query(PreparedQueryDef {
        id: "q-1".into(),
        name: "db-query".into(),
        service: "db".into(),
        dns_ttl_secs: Some(10),
    });

    catalog
}

fn server_with(cfg: DnsConfig) -> Arc<DnsServer> {
    let catalog = seeded_catalog();
    let cache = Arc::new(PassthroughCache::new(catalog.clone()));
    let reader = Arc::new(CatalogReader::new(catalog, cache));
    let translator = Arc::new(TaggedAddressTranslator::new(cfg.datacenter.clone()));
    Arc::new(DnsServer::new(&cfg, reader, translator).unwrap())
}

fn server() -> Arc<DnsServer> {
    server_with(DnsConfig::default())
}

fn src() -> SocketAddr {
    "127.0.0.1:5353".parse().unwrap()
}

fn query_bytes(name: &str, rtype: RecordType) -> Vec<u8> {
    let mut msg = Message::new(4321, MessageType::Query, OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_utf8(name).unwrap(), rtype));
    msg.to_vec().unwrap()
}

async fn ask_raw(server: &DnsServer, bytes: Vec<u8>) -> Message {
    let reply = server
        .handle(&bytes, Transport::Udp, src())
        .await
        .expect("no reply bytes");
    Message::from_bytes(&reply).expect("undecodable reply")
}

async fn ask(server: &DnsServer, name: &str, rtype: RecordType) -> Message {
    ask_raw(server, query_bytes(name, rtype)).await
}

fn a_addrs(records: &[Record]) -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = records
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect();
    out.sort();
    out
}

fn srv_targets(records: &[Record]) -> Vec<String> {
    let mut out: Vec<String> = records
        .iter()
        .filter_map(|r| match r.data() {
            RData::SRV(srv) => Some(srv.target().to_string()),
            _ => None,
        })
        .collect();
    out.sort();
    out
}

fn txt_strings(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match r.data() {
            RData::TXT(txt) => Some(
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).to_string())
                    .collect::<String>(),
            ),
            _ => None,
        })
        .collect()
}

fn has_soa(records: &[Record]) -> bool {
    records.iter().any(|r| matches!(r.data(), RData::SOA(_)))
}

#[tokio::test]
async fn node_a_lookup_echoes_header_and_answers() {
    let server = server();
    let resp = ask(&server, "foo.node.corral.", RecordType::A).await;

    assert_eq!(resp.id(), 4321);
    assert!(resp.authoritative());
    assert!(resp.recursion_desired());
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(a_addrs(resp.answers()), vec![Ipv4Addr::new(10, 0, 0, 1)]);
    // Node metadata rides along as additional TXT for address questions.
    assert!(txt_strings(resp.additionals()).contains(&"rack=r1".to_string()));

    // The datacenter label is optional for the local datacenter.
    let resp = ask(&server, "foo.node.dc1.corral.", RecordType::A).await;
    assert_eq!(a_addrs(resp.answers()), vec![Ipv4Addr::new(10, 0, 0, 1)]);
}

#[tokio::test]
async fn node_txt_lookup_answers_metadata_only() {
    let server = server();
    let resp = ask(&server, "foo.node.corral.", RecordType::TXT).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(txt_strings(resp.answers()), vec!["rack=r1".to_string()]);
    assert!(a_addrs(resp.answers()).is_empty());
}

#[tokio::test]
async fn node_aaaa_on_v4_only_node_is_nodata() {
    let server = server();
    let resp = ask(&server, "foo.node.corral.", RecordType::AAAA).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert!(resp.answers().is_empty());
    assert!(has_soa(resp.name_servers()));
}

#[tokio::test]
async fn unknown_names_are_nxdomain_with_soa() {
    let server = server();

    let resp = ask(&server, "nope.service.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    assert!(resp.answers().is_empty());
    assert!(has_soa(resp.name_servers()));

    let resp = ask(&server, "nope.node.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    assert!(has_soa(resp.name_servers()));
}

#[tokio::test]
async fn service_lookup_excludes_failing_instances() {
    let mut cfg = DnsConfig::default();
    cfg.service_ttl.insert("db".into(), 10);
    let server = server_with(cfg);

    let resp = ask(&server, "db.service.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(
        a_addrs(resp.answers()),
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
    assert!(resp.answers().iter().all(|r| r.ttl() == 10));
}

#[tokio::test]
async fn service_srv_targets_nodes_with_glue() {
    let server = server();
    let resp = ask(&server, "db.service.corral.", RecordType::SRV).await;

    assert_eq!(
        srv_targets(resp.answers()),
        vec![
            "bar.node.dc1.corral.".to_string(),
            "foo.node.dc1.corral.".to_string()
        ]
    );
    assert_eq!(
        a_addrs(resp.additionals()),
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
    // foo's metadata becomes TXT glue at the node name.
    assert!(txt_strings(resp.additionals()).contains(&"rack=r1".to_string()));
}

#[tokio::test]
async fn rfc2782_forms_filter_by_tag() {
    let server = server();

    // The _tcp pseudo-tag means no tag filter.
    let resp = ask(&server, "_db._tcp.service.corral.", RecordType::SRV).await;
    assert_eq!(resp.answers().len(), 2);

    let resp = ask(&server, "_db._primary.service.corral.", RecordType::SRV).await;
    assert_eq!(
        srv_targets(resp.answers()),
        vec!["foo.node.dc1.corral.".to_string()]
    );

    let resp = ask(&server, "_db._nosuchtag.service.corral.", RecordType::SRV).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn rfc2782_form_without_service_keyword_implies_service() {
    let server = server();

    // SRV question with a leading underscore label directly under the
    // domain, no `service` keyword.
    let resp = ask(&server, "_db._tcp.corral.", RecordType::SRV).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(
        srv_targets(resp.answers()),
        vec![
            "bar.node.dc1.corral.".to_string(),
            "foo.node.dc1.corral.".to_string()
        ]
    );

    // Only SRV questions take the shorthand.
    let resp = ask(&server, "_db._tcp.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);

    // Without the underscore the name stays meaningless.
    let resp = ask(&server, "db.tcp.corral.", RecordType::SRV).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn rfc2782_prepared_query_form_strips_protocol_label() {
    let server = server();
    let resp = ask(&server, "_db-query._tcp.query.corral.", RecordType::SRV).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(resp.answers().len(), 2);
    assert!(resp.answers().iter().all(|r| r.ttl() == 10));
}

#[tokio::test]
async fn legacy_tag_form_filters_by_tag() {
    let server = server();
    let resp = ask(&server, "replica.db.service.corral.", RecordType::A).await;
    assert_eq!(a_addrs(resp.answers()), vec![Ipv4Addr::new(10, 0, 0, 2)]);
}

#[tokio::test]
async fn connect_lookup_selects_mesh_capable_instances() {
    let server = server();

    let resp = ask(&server, "pg.connect.corral.", RecordType::A).await;
    assert_eq!(a_addrs(resp.answers()), vec![Ipv4Addr::new(10, 0, 0, 5)]);

    let resp = ask(&server, "pg.service.corral.", RecordType::A).await;
    assert_eq!(resp.answers().len(), 2);
}

#[tokio::test]
async fn addr_labels_decode_to_addresses() {
    let server = server();

    let resp = ask(&server, "7f000001.addr.corral.", RecordType::A).await;
    assert_eq!(a_addrs(resp.answers()), vec![Ipv4Addr::new(127, 0, 0, 1)]);

    // Not a valid IPv4/IPv6 hex length.
    let resp = ask(&server, "7f00.addr.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn addr_record_moves_to_additionals_on_family_mismatch() {
    let server = server();

    // An IPv4 label asked as SRV: the address record is glue, not an
    // answer, and the empty answer set gets the negative-answer SOA.
    let resp = ask(&server, "7f000001.addr.corral.", RecordType::SRV).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert!(resp.answers().is_empty());
    assert_eq!(
        a_addrs(resp.additionals()),
        vec![Ipv4Addr::new(127, 0, 0, 1)]
    );
    assert!(has_soa(resp.name_servers()));

    let resp = ask(&server, "7f000001.addr.corral.", RecordType::AAAA).await;
    assert!(resp.answers().is_empty());
    assert_eq!(
        a_addrs(resp.additionals()),
        vec![Ipv4Addr::new(127, 0, 0, 1)]
    );
}

#[tokio::test]
async fn prepared_query_applies_stored_ttl() {
    let server = server();

    let resp = ask(&server, "db-query.query.corral.", RecordType::A).await;
    assert_eq!(resp.answers().len(), 2);
    assert!(resp.answers().iter().all(|r| r.ttl() == 10));

    let resp = ask(&server, "nope.query.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn plain_udp_clients_get_a_capped_answer_count() {
    let server = server();
    let resp = ask(&server, "web.service.corral.", RecordType::A).await;
    assert_eq!(resp.answers().len(), 3);
    // TC stays clear unless truncation reporting is enabled.
    assert!(!resp.truncated());
}

#[tokio::test]
async fn edns_clients_get_the_full_answer_set() {
    let server = server();

    let mut msg = Message::new(77, MessageType::Query, OpCode::Query);
    msg.add_query(Query::query(
        Name::from_utf8("web.service.corral.").unwrap(),
        RecordType::A,
    ));
    let mut edns = Edns::new();
    edns.set_max_payload(4096);
    msg.set_edns(edns);

    let resp = ask_raw(&server, msg.to_vec().unwrap()).await;
    assert_eq!(resp.answers().len(), 6);
    let reply_edns = resp.extensions().as_ref().expect("OPT expected");
    assert!(reply_edns.max_payload() >= 512);
}

#[tokio::test]
async fn client_subnet_is_echoed_with_scope() {
    let server = server();

    let mut msg = Message::new(78, MessageType::Query, OpCode::Query);
    msg.add_query(Query::query(
        Name::from_utf8("db.service.corral.").unwrap(),
        RecordType::A,
    ));
    let mut edns = Edns::new();
    edns.set_max_payload(1280);
    // family 1, /24 source, scope 0, 10.1.2.0
    edns.options_mut()
        .insert(EdnsOption::Unknown(8, vec![0, 1, 24, 0, 10, 1, 2]));
    msg.set_edns(edns);

    let resp = ask_raw(&server, msg.to_vec().unwrap()).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    let reply_edns = resp.extensions().as_ref().expect("OPT expected");
    assert!(reply_edns.option(EdnsCode::Subnet).is_some());
}

#[tokio::test]
async fn ns_and_soa_queries_describe_the_zone() {
    let server = server();

    let resp = ask(&server, "corral.", RecordType::NS).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    let ns_targets: Vec<String> = resp
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::NS(ns) => Some(ns.0.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(ns_targets.len(), 2);
    assert!(ns_targets.iter().all(|t| t.ends_with(".node.dc1.corral.")));
    assert_eq!(a_addrs(resp.additionals()).len(), 2);

    let resp = ask(&server, "corral.", RecordType::SOA).await;
    assert!(has_soa(resp.answers()));
    assert_eq!(resp.name_servers().len(), 2);
}

#[tokio::test]
async fn reverse_lookups_cover_nodes_and_service_addresses() {
    let server = server();

    let resp = ask(&server, "1.0.0.10.in-addr.arpa.", RecordType::PTR).await;
    let ptr: Vec<String> = resp
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::PTR(ptr) => Some(ptr.0.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(ptr, vec!["foo.node.dc1.corral.".to_string()]);
    assert_eq!(resp.answers()[0].ttl(), 0);

    let resp = ask(&server, "7.7.168.192.in-addr.arpa.", RecordType::PTR).await;
    let ptr: Vec<String> = resp
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::PTR(ptr) => Some(ptr.0.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(ptr, vec!["app.service.corral.".to_string()]);
}

#[tokio::test]
async fn reverse_soa_question_carries_the_zone_soa() {
    let server = server();
    let resp = ask(&server, "1.0.0.10.in-addr.arpa.", RecordType::SOA).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    // The PTR answer still rides along, the SOA describes the zone.
    assert_eq!(resp.answers().len(), 1);
    assert!(has_soa(resp.name_servers()));
}

#[tokio::test]
async fn unmatched_reverse_lookup_fails_without_recursors() {
    let server = server();
    let resp = ask(&server, "9.9.9.9.in-addr.arpa.", RecordType::PTR).await;
    assert_eq!(resp.response_code(), ResponseCode::ServFail);
}

#[tokio::test]
async fn zone_transfers_are_not_implemented() {
    let server = server();
    let resp = ask(&server, "corral.", RecordType::AXFR).await;
    assert_eq!(resp.response_code(), ResponseCode::NotImp);
}

#[tokio::test]
async fn datacenter_label_routes_the_lookup() {
    let server = server();

    let resp = ask(&server, "db.service.dc1.corral.", RecordType::A).await;
    assert_eq!(resp.answers().len(), 2);

    // No instances registered in dc2.
    let resp = ask(&server, "db.service.dc2.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);

    // Two trailing labels before the domain never parse.
    let resp = ask(&server, "db.service.x.y.corral.", RecordType::A).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn alt_domain_answers_keep_alt_names() {
    let cfg = DnsConfig {
        alt_domain: Some("alt.example.com".into()),
        ..DnsConfig::default()
    };
    let server = server_with(cfg);

    let resp = ask(&server, "db.service.alt.example.com.", RecordType::SRV).await;
    let targets = srv_targets(resp.answers());
    assert_eq!(targets.len(), 2);
    assert!(targets
        .iter()
        .all(|t| t.ends_with(".node.dc1.alt.example.com.")));

    // The primary domain still answers with primary names.
    let resp = ask(&server, "db.service.corral.", RecordType::SRV).await;
    assert!(srv_targets(resp.answers())
        .iter()
        .all(|t| t.ends_with(".node.dc1.corral.")));
}

#[tokio::test]
async fn external_node_address_becomes_a_cname() {
    let server = server();
    let resp = ask(&server, "site.service.corral.", RecordType::A).await;
    assert_eq!(resp.answers().len(), 1);
    match resp.answers()[0].data() {
        RData::CNAME(cname) => assert_eq!(cname.0.to_string(), "web.example.com."),
        other => panic!("expected CNAME, got {other:?}"),
    }
}

#[tokio::test]
async fn remote_node_hostname_cname_uses_the_wan_address() {
    let server = server();
    let resp = ask(&server, "site2.service.dc2.corral.", RecordType::A).await;
    assert_eq!(resp.answers().len(), 1);
    match resp.answers()[0].data() {
        RData::CNAME(cname) => assert_eq!(cname.0.to_string(), "public.example.com."),
        other => panic!("expected CNAME, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_requests_get_formerr_or_silence() {
    let server = server();

    let reply = server
        .handle(&[0xAA, 0xBB, 0xCC], Transport::Udp, src())
        .await
        .expect("short garbage still gets a FORMERR");
    assert_eq!(&reply[0..2], &[0xAA, 0xBB]);
    assert_eq!(reply[3] & 0x0F, 1);

    assert!(server.handle(&[0x01], Transport::Udp, src()).await.is_none());
}
