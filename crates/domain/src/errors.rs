use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DnsError {
    /// The queried name does not exist (NXDOMAIN + SOA).
    #[error("DNS name not found")]
    NameNotFound,

    /// The name exists but has no records of the requested type
    /// (RFC 2308 NODATA: NOERROR, empty answer, SOA in authority).
    #[error("no DNS answer for query type")]
    NoData,

    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("query timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed DNS message: {0}")]
    Proto(String),

    #[error("i/o error: {0}")]
    Io(String),
}
