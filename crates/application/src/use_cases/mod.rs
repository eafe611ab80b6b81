pub mod catalog_read;

pub use catalog_read::CatalogReader;
