//! WAN address substitution.
//!
//! When a record describes a resource in another datacenter, the `wan`
//! tagged address (and port) replaces the internal one, so cross-DC
//! answers stay reachable.

use corral_dns_application::ports::AddressTranslator;
use corral_dns_domain::catalog::ServiceTaggedAddress;
use std::collections::HashMap;

const WAN_TAG: &str = "wan";

pub struct TaggedAddressTranslator {
    local_datacenter: String,
}

impl TaggedAddressTranslator {
    pub fn new(local_datacenter: impl Into<String>) -> Self {
        Self {
            local_datacenter: local_datacenter.into(),
        }
    }

    fn is_remote(&self, datacenter: &str) -> bool {
        !datacenter.eq_ignore_ascii_case(&self.local_datacenter)
    }
}

impl AddressTranslator for TaggedAddressTranslator {
    fn translate_node_address(
        &self,
        datacenter: &str,
        address: &str,
        tagged_addresses: &HashMap<String, String>,
    ) -> String {
        if self.is_remote(datacenter) {
            if let Some(wan) = tagged_addresses.get(WAN_TAG) {
                if !wan.is_empty() {
                    return wan.clone();
                }
            }
        }
        address.to_string()
    }

    fn translate_service_address(
        &self,
        datacenter: &str,
        address: &str,
        tagged_addresses: &HashMap<String, ServiceTaggedAddress>,
    ) -> String {
        if self.is_remote(datacenter) {
            if let Some(wan) = tagged_addresses.get(WAN_TAG) {
                if !wan.address.is_empty() {
                    return wan.address.clone();
                }
            }
        }
        address.to_string()
    }

    fn translate_service_port(
        &self,
        datacenter: &str,
        port: u16,
        tagged_addresses: &HashMap<String, ServiceTaggedAddress>,
    ) -> u16 {
        if self.is_remote(datacenter) {
            if let Some(wan) = tagged_addresses.get(WAN_TAG) {
                if wan.port != 0 {
                    return wan.port;
                }
            }
        }
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses_pass_through() {
        let translator = TaggedAddressTranslator::new("dc1");
        let mut tagged = HashMap::new();
        tagged.insert(WAN_TAG.to_string(), "198.51.100.1".to_string());
        assert_eq!(
            translator.translate_node_address("dc1", "10.0.0.1", &tagged),
            "10.0.0.1"
        );
    }

    #[test]
    fn remote_nodes_get_the_wan_address() {
        let translator = TaggedAddressTranslator::new("dc1");
        let mut tagged = HashMap::new();
        tagged.insert(WAN_TAG.to_string(), "198.51.100.1".to_string());
        assert_eq!(
            translator.translate_node_address("dc2", "10.0.0.1", &tagged),
            "198.51.100.1"
        );
        // No wan address registered: keep the internal one.
        assert_eq!(
            translator.translate_node_address("dc2", "10.0.0.1", &HashMap::new()),
            "10.0.0.1"
        );
    }

    #[test]
    fn remote_services_get_wan_address_and_port() {
        let translator = TaggedAddressTranslator::new("dc1");
        let mut tagged = HashMap::new();
        tagged.insert(
            WAN_TAG.to_string(),
            ServiceTaggedAddress {
                address: "198.51.100.2".to_string(),
                port: 443,
            },
        );
        assert_eq!(
            translator.translate_service_address("dc2", "10.0.0.5", &tagged),
            "198.51.100.2"
        );
        assert_eq!(translator.translate_service_port("dc2", 8443, &tagged), 443);
        assert_eq!(translator.translate_service_port("dc1", 8443, &tagged), 8443);
    }
}
