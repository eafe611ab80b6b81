use clap::Parser;
use corral_dns_application::CatalogReader;
use corral_dns_infrastructure::catalog::{InMemoryCatalog, PassthroughCache, TaggedAddressTranslator};
use corral_dns_infrastructure::dns::{listen, DnsServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};

mod bootstrap;

use bootstrap::CliOverrides;

#[derive(Parser)]
#[command(name = "corral-dns")]
#[command(version)]
#[command(about = "Corral DNS - service discovery DNS responder")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// DNS server port
    #[arg(short = 'd', long)]
    dns_port: Option<u16>,

    /// Bind address
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        dns_port: cli.dns_port,
        bind_address: cli.bind.clone(),
        log_level: cli.log_level.clone(),
    };
    let config = bootstrap::load_config(cli.config.as_deref(), overrides)?;
    bootstrap::init_logging(&config);

    info!("Starting Corral DNS v{}", env!("CARGO_PKG_VERSION"));

    let catalog = Arc::new(InMemoryCatalog::new(config.catalog.clone()));
    let cache = Arc::new(PassthroughCache::new(catalog.clone()));
    let reader = Arc::new(CatalogReader::new(catalog.clone(), cache));
    let translator = Arc::new(TaggedAddressTranslator::new(config.dns.datacenter.clone()));

    let server = Arc::new(DnsServer::new(&config.dns, reader, translator)?);

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.dns_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    let udp = UdpSocket::bind(addr).await?;
    let tcp = TcpListener::bind(addr).await?;

    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = listen::serve_udp(server, udp).await {
                error!(error = %e, "udp listener failed");
            }
        });
    }
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = listen::serve_tcp(server, tcp).await {
                error!(error = %e, "tcp listener failed");
            }
        });
    }

    // SIGHUP re-reads the configuration file and swaps the DNS snapshot.
    #[cfg(unix)]
    {
        let server = Arc::clone(&server);
        let config_path = cli.config.clone();
        tokio::spawn(async move {
            let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "unable to install SIGHUP handler");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                match bootstrap::load_config(config_path.as_deref(), CliOverrides::default()) {
                    Ok(new_config) => match server.reload(&new_config.dns) {
                        Ok(()) => info!("configuration reloaded"),
                        Err(e) => error!(error = %e, "configuration reload rejected"),
                    },
                    Err(e) => error!(error = %e, "failed to re-read configuration"),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Server shutdown complete");
    Ok(())
}
