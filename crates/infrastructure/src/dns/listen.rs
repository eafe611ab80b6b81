//! UDP and TCP listeners feeding [`DnsServer::handle`].

use crate::dns::message::Transport;
use crate::dns::server::DnsServer;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const MAX_UDP_REQUEST: usize = 65535;
/// Idle TCP connections are dropped after this long without a frame.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts datagrams forever; each request is served on its own task.
pub async fn serve_udp(server: Arc<DnsServer>, socket: UdpSocket) -> io::Result<()> {
    let socket = Arc::new(socket);
    info!(addr = %socket.local_addr()?, "DNS server listening (udp)");
    let mut buf = vec![0u8; MAX_UDP_REQUEST];
    loop {
        let (n, src) = socket.recv_from(&mut buf).await?;
        let data = buf[..n].to_vec();
        let server = Arc::clone(&server);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Some(reply) = server.handle(&data, Transport::Udp, src).await {
                if let Err(e) = socket.send_to(&reply, src).await {
                    debug!(client = %src, error = %e, "failed to send response");
                }
            }
        });
    }
}

/// Accepts connections forever; frames are two-byte length prefixed per
/// RFC 1035 section 4.2.2.
pub async fn serve_tcp(server: Arc<DnsServer>, listener: TcpListener) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "DNS server listening (tcp)");
    loop {
        let (stream, src) = listener.accept().await?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = serve_tcp_conn(server, stream, src).await {
                debug!(client = %src, error = %e, "tcp connection ended");
            }
        });
    }
}

async fn serve_tcp_conn(
    server: Arc<DnsServer>,
    mut stream: TcpStream,
    src: SocketAddr,
) -> io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            // Idle or cleanly closed; either way we are done.
            Err(_) => return Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) => {}
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut body))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request body timed out"))??;

        if let Some(reply) = server.handle(&body, Transport::Tcp, src).await {
            if reply.len() > u16::MAX as usize {
                warn!(client = %src, len = reply.len(), "response too large for a tcp frame");
                continue;
            }
            stream.write_all(&(reply.len() as u16).to_be_bytes()).await?;
            stream.write_all(&reply).await?;
            stream.flush().await?;
        }
    }
}
