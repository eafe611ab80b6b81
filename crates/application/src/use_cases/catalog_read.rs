//! Stale-read policy over the catalog ports.
//!
//! Reads go through the cache when the configuration says so, otherwise
//! straight to the RPC port. When a stale read comes back lagging the
//! leader by more than the configured maximum, the read is re-issued
//! exactly once with staleness cleared and the cache bypassed.

use crate::ports::{
    CatalogCache, CatalogRpc, DcSpecificRequest, NodeListReply, NodeServicesReply,
    NodeSpecificRequest, PreparedQueryExecuteRequest, PreparedQueryReply, ServiceNodesReply,
    ServiceSpecificRequest,
};
use corral_dns_domain::{catalog, DnsError, DnsRuntimeConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Reads lagging the leader by more than this bump the stale counter.
const STALE_COUNTER_THRESHOLD: Duration = Duration::from_secs(5);

pub struct CatalogReader {
    rpc: Arc<dyn CatalogRpc>,
    cache: Arc<dyn CatalogCache>,
    stale_queries: AtomicU64,
}

impl CatalogReader {
    pub fn new(rpc: Arc<dyn CatalogRpc>, cache: Arc<dyn CatalogCache>) -> Self {
        Self {
            rpc,
            cache,
            stale_queries: AtomicU64::new(0),
        }
    }

    /// Number of reads answered by a replica lagging more than the
    /// 5-second counter threshold. Observability only; never alters
    /// results.
    pub fn stale_queries(&self) -> u64 {
        self.stale_queries.load(Ordering::Relaxed)
    }

    /// Checks the staleness of a reply; returns true when the read must be
    /// re-issued fresh.
    fn too_stale(&self, cfg: &DnsRuntimeConfig, allow_stale: bool, last_contact: Duration) -> bool {
        if !allow_stale {
            return false;
        }
        if last_contact > cfg.max_stale {
            warn!(
                last_contact = ?last_contact,
                "query results too stale, re-requesting"
            );
            return true;
        }
        if last_contact > STALE_COUNTER_THRESHOLD {
            self.stale_queries.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    pub async fn node_services(
        &self,
        cfg: &DnsRuntimeConfig,
        mut req: NodeSpecificRequest,
    ) -> Result<NodeServicesReply, DnsError> {
        req.options.allow_stale = cfg.allow_stale;
        req.options.max_age = cfg.cache_max_age;

        let mut use_cache = cfg.use_cache;
        loop {
            let reply = if use_cache {
                self.cache.node_services(req.clone()).await?.0
            } else {
                self.rpc.node_services(req.clone()).await?
            };
            if self.too_stale(cfg, req.options.allow_stale, reply.last_contact) {
                req.options.allow_stale = false;
                use_cache = false;
                continue;
            }
            return Ok(reply);
        }
    }

    /// Service instances, already health-filtered per the snapshot's
    /// only-passing flag. The filtered list is a copy; cached replies are
    /// never modified.
    pub async fn service_nodes(
        &self,
        cfg: &DnsRuntimeConfig,
        mut req: ServiceSpecificRequest,
    ) -> Result<ServiceNodesReply, DnsError> {
        req.options.allow_stale = cfg.allow_stale;
        req.options.max_age = cfg.cache_max_age;

        let mut use_cache = cfg.use_cache;
        let mut reply = loop {
            let (reply, hit) = if use_cache {
                self.cache.service_nodes(req.clone()).await?
            } else {
                (self.rpc.service_nodes(req.clone()).await?, false)
            };
            debug!(service = %req.service, cache_hit = hit, "catalog service read");
            if self.too_stale(cfg, req.options.allow_stale, reply.last_contact) {
                req.options.allow_stale = false;
                use_cache = false;
                continue;
            }
            break reply;
        };

        reply.instances = catalog::filter_by_health(&reply.instances, cfg.only_passing);
        Ok(reply)
    }

    /// Full node listing for the datacenter. Reverse lookups scan this;
    /// there is no cache port for it, so reads always hit the RPC surface.
    pub async fn list_nodes(
        &self,
        cfg: &DnsRuntimeConfig,
        mut req: DcSpecificRequest,
    ) -> Result<NodeListReply, DnsError> {
        req.options.allow_stale = cfg.allow_stale;
        req.options.max_age = cfg.cache_max_age;

        loop {
            let reply = self.rpc.list_nodes(req.clone()).await?;
            if self.too_stale(cfg, req.options.allow_stale, reply.last_contact) {
                req.options.allow_stale = false;
                continue;
            }
            return Ok(reply);
        }
    }

    /// Prepared-query execution. Health filtering is the server's job for
    /// prepared queries, so instances pass through untouched.
    pub async fn prepared_query(
        &self,
        cfg: &DnsRuntimeConfig,
        mut req: PreparedQueryExecuteRequest,
    ) -> Result<PreparedQueryReply, DnsError> {
        req.options.allow_stale = cfg.allow_stale;
        req.options.max_age = cfg.cache_max_age;

        let mut use_cache = cfg.use_cache;
        loop {
            let (reply, hit) = if use_cache {
                self.cache.prepared_query_execute(req.clone()).await?
            } else {
                (self.rpc.prepared_query_execute(req.clone()).await?, false)
            };
            debug!(
                prepared_query = %req.query_id_or_name,
                cache_hit = hit,
                "prepared query executed"
            );
            if self.too_stale(cfg, req.options.allow_stale, reply.last_contact) {
                req.options.allow_stale = false;
                use_cache = false;
                continue;
            }
            return Ok(reply);
        }
    }
}
