//! In-memory catalog backend.
//!
//! Registrations are held as plain instance records, loadable from the
//! configuration file at startup and mutable at runtime. The reply
//! `last_contact` is settable so the stale-read policy can be exercised
//! end to end.

use async_trait::async_trait;
use corral_dns_application::ports::{
    CatalogCache, CatalogRpc, DcSpecificRequest, NodeListReply, NodeServicesReply,
    NodeSpecificRequest, PreparedQueryExecuteRequest, PreparedQueryReply, ServiceNodesReply,
    ServiceSpecificRequest,
};
use corral_dns_domain::catalog::{CheckServiceInstance, Node};
use corral_dns_domain::DnsError;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// A stored query definition: a named service lookup executed server-side.
#[derive(Debug, Clone, Deserialize)]
pub struct PreparedQueryDef {
    pub id: String,
    pub name: String,
    pub service: String,
    /// TTL carried into DNS answers, seconds.
    #[serde(default)]
    pub dns_ttl_secs: Option<u64>,
}

/// Startup registrations, deserialized from the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub instances: Vec<CheckServiceInstance>,
    #[serde(default)]
    pub prepared_queries: Vec<PreparedQueryDef>,
}

#[derive(Default)]
struct CatalogState {
    instances: Vec<CheckServiceInstance>,
    prepared_queries: Vec<PreparedQueryDef>,
}

pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    /// Reported replica lag, milliseconds.
    last_contact_ms: AtomicU64,
}

impl InMemoryCatalog {
    pub fn new(seed: CatalogSeed) -> Self {
        Self {
            state: RwLock::new(CatalogState {
                instances: seed.instances,
                prepared_queries: seed.prepared_queries,
            }),
            last_contact_ms: AtomicU64::new(0),
        }
    }

    pub fn register(&self, instance: CheckServiceInstance) {
        if let Ok(mut state) = self.state.write() {
            state.instances.push(instance);
        }
    }

    pub fn register_prepared_query(&self, def: PreparedQueryDef) {
        if let Ok(mut state) = self.state.write() {
            state.prepared_queries.push(def);
        }
    }

    /// Forces subsequent replies to report this replica lag.
    pub fn set_last_contact(&self, lag: Duration) {
        self.last_contact_ms
            .store(lag.as_millis() as u64, Ordering::Relaxed);
    }

    fn last_contact(&self) -> Duration {
        Duration::from_millis(self.last_contact_ms.load(Ordering::Relaxed))
    }

    fn lock_err() -> DnsError {
        DnsError::Rpc("catalog state poisoned".to_string())
    }
}

fn service_matches(instance: &CheckServiceInstance, req: &ServiceSpecificRequest) -> bool {
    if !instance.node.datacenter.eq_ignore_ascii_case(&req.datacenter) {
        return false;
    }
    if let Some(addr) = &req.service_address {
        return instance.service.address == *addr;
    }
    if !instance.service.name.eq_ignore_ascii_case(&req.service) {
        return false;
    }
    if req.connect && !instance.service.connect {
        return false;
    }
    if let Some(tag) = &req.tag {
        return instance
            .service
            .tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tag));
    }
    true
}

#[async_trait]
impl CatalogRpc for InMemoryCatalog {
    async fn node_services(
        &self,
        req: NodeSpecificRequest,
    ) -> Result<NodeServicesReply, DnsError> {
        let state = self.state.read().map_err(|_| Self::lock_err())?;
        let node = state
            .instances
            .iter()
            .map(|i| &i.node)
            .find(|n| {
                n.datacenter.eq_ignore_ascii_case(&req.datacenter)
                    && n.name.eq_ignore_ascii_case(&req.node)
            })
            .cloned();
        Ok(NodeServicesReply {
            node,
            last_contact: self.last_contact(),
        })
    }

    async fn service_nodes(
        &self,
        req: ServiceSpecificRequest,
    ) -> Result<ServiceNodesReply, DnsError> {
        let state = self.state.read().map_err(|_| Self::lock_err())?;
        let instances = state
            .instances
            .iter()
            .filter(|i| service_matches(i, &req))
            .cloned()
            .collect();
        Ok(ServiceNodesReply {
            instances,
            last_contact: self.last_contact(),
        })
    }

    async fn list_nodes(&self, req: DcSpecificRequest) -> Result<NodeListReply, DnsError> {
        let state = self.state.read().map_err(|_| Self::lock_err())?;
        let mut nodes: Vec<Node> = Vec::new();
        for instance in &state.instances {
            if !instance
                .node
                .datacenter
                .eq_ignore_ascii_case(&req.datacenter)
            {
                continue;
            }
            if !nodes.iter().any(|n| n.name == instance.node.name) {
                nodes.push(instance.node.clone());
            }
        }
        Ok(NodeListReply {
            nodes,
            last_contact: self.last_contact(),
        })
    }

    async fn prepared_query_execute(
        &self,
        req: PreparedQueryExecuteRequest,
    ) -> Result<PreparedQueryReply, DnsError> {
        let state = self.state.read().map_err(|_| Self::lock_err())?;
        let def = state
            .prepared_queries
            .iter()
            .find(|d| {
                d.id.eq_ignore_ascii_case(&req.query_id_or_name)
                    || d.name.eq_ignore_ascii_case(&req.query_id_or_name)
            })
            .cloned()
            .ok_or(DnsError::NameNotFound)?;

        let lookup = ServiceSpecificRequest {
            datacenter: req.datacenter.clone(),
            service: def.service.clone(),
            tag: None,
            connect: false,
            service_address: None,
            options: req.options.clone(),
        };
        let instances: Vec<CheckServiceInstance> = state
            .instances
            .iter()
            .filter(|i| service_matches(i, &lookup))
            .cloned()
            .collect();
        let instances = corral_dns_domain::catalog::filter_by_health(&instances, false);

        Ok(PreparedQueryReply {
            service: def.service,
            datacenter: req.datacenter,
            instances,
            dns_ttl: def.dns_ttl_secs.map(Duration::from_secs),
            last_contact: self.last_contact(),
        })
    }
}

/// Cache port that forwards every read to the backend and reports a miss.
/// Keeps the cache seam in place without holding state.
pub struct PassthroughCache {
    rpc: Arc<dyn CatalogRpc>,
}

impl PassthroughCache {
    pub fn new(rpc: Arc<dyn CatalogRpc>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl CatalogCache for PassthroughCache {
    async fn node_services(
        &self,
        req: NodeSpecificRequest,
    ) -> Result<(NodeServicesReply, bool), DnsError> {
        Ok((self.rpc.node_services(req).await?, false))
    }

    async fn service_nodes(
        &self,
        req: ServiceSpecificRequest,
    ) -> Result<(ServiceNodesReply, bool), DnsError> {
        Ok((self.rpc.service_nodes(req).await?, false))
    }

    async fn prepared_query_execute(
        &self,
        req: PreparedQueryExecuteRequest,
    ) -> Result<(PreparedQueryReply, bool), DnsError> {
        Ok((self.rpc.prepared_query_execute(req).await?, false))
    }
}
