pub mod address_translator;
pub mod catalog;

pub use address_translator::AddressTranslator;
pub use catalog::{
    CatalogCache, CatalogRpc, DcSpecificRequest, NodeListReply, NodeServicesReply,
    NodeSpecificRequest, PreparedQueryExecuteRequest, PreparedQueryReply, QueryOptions,
    ServiceNodesReply, ServiceSpecificRequest,
};
