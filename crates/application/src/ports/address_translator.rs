//! WAN/LAN address translation.
//!
//! Pure substitutions applied to every instance before record synthesis:
//! when the requesting datacenter differs from the instance's, the
//! translator may swap in a tagged (typically `wan`) address or port.

use corral_dns_domain::catalog::ServiceTaggedAddress;
use std::collections::HashMap;

pub trait AddressTranslator: Send + Sync {
    /// Translates a node address for a query targeting `datacenter`.
    /// Returns the input unchanged when no substitution applies.
    fn translate_node_address(
        &self,
        datacenter: &str,
        address: &str,
        tagged_addresses: &HashMap<String, String>,
    ) -> String;

    fn translate_service_address(
        &self,
        datacenter: &str,
        address: &str,
        tagged_addresses: &HashMap<String, ServiceTaggedAddress>,
    ) -> String;

    fn translate_service_port(
        &self,
        datacenter: &str,
        port: u16,
        tagged_addresses: &HashMap<String, ServiceTaggedAddress>,
    ) -> u16;
}
