//! Typed requests and replies for the catalog backend.
//!
//! The DNS engine consumes the catalog through these two ports: a direct
//! RPC surface and a read-through cache with the same request shapes. The
//! engine never mutates a reply in place.

use async_trait::async_trait;
use corral_dns_domain::{CheckServiceInstance, DnsError, Node};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub allow_stale: bool,
    /// Maximum acceptable cache entry age; only meaningful to the cache port.
    pub max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeSpecificRequest {
    pub datacenter: String,
    pub node: String,
    pub options: QueryOptions,
}

#[derive(Debug, Clone)]
pub struct ServiceSpecificRequest {
    pub datacenter: String,
    pub service: String,
    /// Tag filter; empty means all instances.
    pub tag: Option<String>,
    /// Restrict to Connect-capable instances.
    pub connect: bool,
    /// Match on the advertised service address instead of the name
    /// (reverse PTR path). `service` is ignored when set.
    pub service_address: Option<String>,
    pub options: QueryOptions,
}

#[derive(Debug, Clone)]
pub struct DcSpecificRequest {
    pub datacenter: String,
    pub options: QueryOptions,
}

#[derive(Debug, Clone)]
pub struct PreparedQueryExecuteRequest {
    pub datacenter: String,
    pub query_id_or_name: String,
    /// Client source address, used server-side for locality-aware answers.
    pub source_ip: Option<IpAddr>,
    pub options: QueryOptions,
}

#[derive(Debug, Clone)]
pub struct NodeServicesReply {
    pub node: Option<Node>,
    /// Time since the replica answering this read last heard from the
    /// leader; zero for non-stale reads.
    pub last_contact: Duration,
}

#[derive(Debug, Clone)]
pub struct ServiceNodesReply {
    pub instances: Vec<CheckServiceInstance>,
    pub last_contact: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeListReply {
    pub nodes: Vec<Node>,
    pub last_contact: Duration,
}

#[derive(Debug, Clone)]
pub struct PreparedQueryReply {
    /// Service name the stored query resolved to.
    pub service: String,
    /// Datacenter the answer instances came from (failover may move it).
    pub datacenter: String,
    pub instances: Vec<CheckServiceInstance>,
    /// TTL carried by the prepared-query definition, if any.
    pub dns_ttl: Option<Duration>,
    pub last_contact: Duration,
}

#[async_trait]
pub trait CatalogRpc: Send + Sync {
    async fn node_services(&self, req: NodeSpecificRequest)
        -> Result<NodeServicesReply, DnsError>;

    async fn service_nodes(&self, req: ServiceSpecificRequest)
        -> Result<ServiceNodesReply, DnsError>;

    async fn list_nodes(&self, req: DcSpecificRequest) -> Result<NodeListReply, DnsError>;

    async fn prepared_query_execute(
        &self,
        req: PreparedQueryExecuteRequest,
    ) -> Result<PreparedQueryReply, DnsError>;
}

/// Read-through cache with the same request shapes as [`CatalogRpc`].
/// The boolean in each reply is the hit indicator, used for diagnostics
/// only.
#[async_trait]
pub trait CatalogCache: Send + Sync {
    async fn node_services(
        &self,
        req: NodeSpecificRequest,
    ) -> Result<(NodeServicesReply, bool), DnsError>;

    async fn service_nodes(
        &self,
        req: ServiceSpecificRequest,
    ) -> Result<(ServiceNodesReply, bool), DnsError>;

    async fn prepared_query_execute(
        &self,
        req: PreparedQueryExecuteRequest,
    ) -> Result<(PreparedQueryReply, bool), DnsError>;
}
