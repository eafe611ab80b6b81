//! Corral DNS Domain Layer
pub mod catalog;
pub mod config;
pub mod errors;

pub use catalog::{
    CheckServiceInstance, HealthCheck, HealthStatus, Node, Service, ServiceTaggedAddress, Weights,
};
pub use config::{DnsConfig, DnsRuntimeConfig, SoaConfig};
pub use errors::DnsError;
