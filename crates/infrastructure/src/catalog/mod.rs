//! Catalog adapters: the in-memory backend, the pass-through cache and
//! the WAN address translator.

pub mod memory;
pub mod translate;

pub use memory::{CatalogSeed, InMemoryCatalog, PassthroughCache, PreparedQueryDef};
pub use translate::TaggedAddressTranslator;
