use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ipnetwork::IpNetwork;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::codec;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum Upstream {
    Udp(SocketAddr),
    Dot { addr: SocketAddr, name: String },
}

impl Upstream {
    /// `udp://ip:port` (or a bare `ip:port`) forwards over plain UDP;
    /// `dot://name@ip:port` speaks length-prefixed DNS over TLS. With no
    /// upstream configured the default is Cloudflare over DoT.
    pub fn parse(spec: &str) -> Result<Upstream> {
        if let Some(rest) = spec.strip_prefix("dot://") {
            let (name, addr) = rest
                .split_once('@')
                .ok_or_else(|| anyhow!("DoT upstream wants name@ip:port, got {spec}"))?;

            return Ok(Upstream::Dot {
                addr: addr.parse().context("DoT upstream address")?,
                name: name.to_string(),
            });
        }

        let bare = spec.strip_prefix("udp://").unwrap_or(spec);

        Ok(Upstream::Udp(
            bare.parse().context("UDP upstream address")?,
        ))
    }

    pub fn default_dot() -> Upstream {
        Upstream::Dot {
            addr: "1.1.1.1:853".parse().unwrap(),
            name: "one.one.one.one".to_string(),
        }
    }
}

/// Relay raw query bytes and return the raw reply, sized to what the
/// upstream actually sent.
pub async fn forward(upstream: &Upstream, query: &[u8]) -> Result<Vec<u8>> {
    tokio::time::timeout(QUERY_TIMEOUT, async {
        match upstream {
            Upstream::Udp(addr) => forward_udp(*addr, query).await,
            Upstream::Dot { addr, name } => forward_dot(*addr, name, query).await,
        }
    })
    .await
    .map_err(|_| anyhow!("Upstream query timed out"))?
}

async fn forward_udp(addr: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };

    let socket = UdpSocket::bind(bind).await?;

    socket.send_to(query, addr).await?;

    let mut buf = [0u8; 4096];

    let (n, _) = socket.recv_from(&mut buf).await?;

    Ok(buf[..n].to_vec())
}

async fn forward_dot(addr: SocketAddr, name: &str, query: &[u8]) -> Result<Vec<u8>> {
    let mut roots = RootCertStore::empty();

    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));

    let server_name =
        ServerName::try_from(name.to_string()).context("DoT upstream server name")?;

    let stream = TcpStream::connect(addr).await?;
    let mut tls = connector.connect(server_name, stream).await?;

    tls.write_all(&frame(query)).await?;
    tls.flush().await?;

    let mut length = [0u8; 2];

    tls.read_exact(&mut length).await?;

    let mut reply = vec![0u8; u16::from_be_bytes(length) as usize];

    tls.read_exact(&mut reply).await?;

    Ok(reply)
}

/// 2-byte length prefix of DNS over stream transports, RFC 1035 §4.2.2.
pub fn frame(query: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + query.len());

    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);

    framed
}

/// Resolve a hostname through the upstream on the engine's own behalf.
pub async fn nslookup(
    upstream: &Upstream,
    host: &str,
    qtype: u16,
    ecs: Option<IpNetwork>,
) -> Result<Vec<IpAddr>> {
    /* transaction ids only disambiguate our own in-flight queries, the
     * low clock bits are plenty */
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_micros() as u16)
        .unwrap_or(0x5744);

    let query = codec::build_query(id, host, qtype, ecs);
    let reply = forward(upstream, &query).await?;

    let addrs = codec::parse_answers(&reply)?;

    if addrs.is_empty() {
        return Err(anyhow!("Upstream has no records for {host}"));
    }

    Ok(addrs)
}
