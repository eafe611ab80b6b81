pub mod authority;
pub mod dispatch;
pub mod edns;
pub mod listen;
pub mod message;
pub mod ptr;
pub mod records;
pub mod recurse;
pub mod server;
pub mod trim;
pub mod wire;

pub use dispatch::QueryEngine;
pub use message::{ResponseMessage, Transport};
pub use server::DnsServer;
