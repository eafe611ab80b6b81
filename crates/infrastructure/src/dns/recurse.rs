//! Upstream recursor client.
//!
//! Out-of-zone queries are relayed byte-for-byte: the client's own query
//! is sent upstream and the upstream's answer is returned untouched, so
//! the exchange stays transparent. Only the header is inspected to decide
//! whether an upstream answer is worth relaying.

use crate::dns::message::Transport;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

const MAX_RESPONSE_SIZE: usize = 65535;

/// Header rcodes worth relaying to the client: NOERROR and NXDOMAIN.
fn relayable_rcode(rcode: u8) -> bool {
    rcode == 0 || rcode == 3
}

pub struct RecursorClient {
    recursors: Vec<SocketAddr>,
    timeout: Duration,
}

impl RecursorClient {
    pub fn new(recursors: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { recursors, timeout }
    }

    /// Relays a raw query to the recursors in order. Returns the first
    /// response carrying a useful rcode, or a truncated one (the client
    /// will retry over TCP). `None` when every upstream failed.
    pub async fn forward(&self, query: &[u8], transport: Transport) -> Option<Vec<u8>> {
        for recursor in &self.recursors {
            let reply = match timeout(self.timeout, self.exchange(*recursor, query, transport)).await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!(recursor = %recursor, error = %e, "recurse failed");
                    continue;
                }
                Err(_) => {
                    warn!(recursor = %recursor, "recurse timed out");
                    continue;
                }
            };
            if reply.len() < 12 {
                warn!(recursor = %recursor, "short response from recursor");
                continue;
            }
            let truncated = reply[2] & 0x02 != 0;
            let rcode = reply[3] & 0x0F;
            if relayable_rcode(rcode) || truncated {
                return Some(reply);
            }
            debug!(recursor = %recursor, rcode, "recursor answered with unusable rcode");
        }
        None
    }

    /// A-record lookup for external CNAME targets. Best effort: the first
    /// recursor that answers wins, failures yield an empty set.
    pub async fn resolve_a(&self, name: &str) -> Vec<Record> {
        let Ok(owner) = Name::from_utf8(name) else {
            return Vec::new();
        };
        let mut query = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
        query.set_recursion_desired(true);
        query.add_query(hickory_proto::op::Query::query(owner, RecordType::A));
        let bytes = match query.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(name = %name, error = %e, "failed to encode recursor query");
                return Vec::new();
            }
        };

        for recursor in &self.recursors {
            let reply = match timeout(
                self.timeout,
                self.exchange(*recursor, &bytes, Transport::Udp),
            )
            .await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!(recursor = %recursor, error = %e, "recurse failed");
                    continue;
                }
                Err(_) => {
                    warn!(recursor = %recursor, "recurse timed out");
                    continue;
                }
            };
            match Message::from_bytes(&reply) {
                Ok(msg) => return msg.answers().to_vec(),
                Err(e) => {
                    warn!(recursor = %recursor, error = %e, "invalid response from recursor");
                }
            }
        }
        Vec::new()
    }

    async fn exchange(
        &self,
        recursor: SocketAddr,
        query: &[u8],
        transport: Transport,
    ) -> io::Result<Vec<u8>> {
        match transport {
            Transport::Udp => {
                let bind: SocketAddr = if recursor.is_ipv4() {
                    "0.0.0.0:0".parse().map_err(io::Error::other)?
                } else {
                    "[::]:0".parse().map_err(io::Error::other)?
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(recursor).await?;
                socket.send(query).await?;
                let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
            Transport::Tcp => {
                let mut stream = TcpStream::connect(recursor).await?;
                stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
                stream.write_all(query).await?;
                stream.flush().await?;
                let mut len_buf = [0u8; 2];
                stream.read_exact(&mut len_buf).await?;
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                stream.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}
