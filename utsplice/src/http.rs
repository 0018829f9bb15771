use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use utcodec::l5::http;

use crate::resolve::Target;
use crate::session::Session;
use crate::Engine;

const HEADER_BUDGET: usize = 16384;

pub async fn serve(engine: Arc<Engine>, listener: TcpListener) -> Result<()> {
    info!("HTTP frontend on {}", listener.local_addr()?);

    loop {
        let (client, peer) = listener.accept().await?;

        if !engine.client_allowed(peer.ip()) {
            info!("Client {peer} is not allowlisted, closing");

            continue;
        }

        let engine = engine.clone();

        tokio::spawn(async move {
            if let Err(e) = handle(engine, client).await {
                debug!("HTTP session from {peer}: {e:#}");
            }
        });
    }
}

async fn handle(engine: Arc<Engine>, mut client: TcpStream) -> Result<()> {
    let mut buf = vec![0u8; HEADER_BUDGET];
    let mut have = 0;

    let end = loop {
        if have == buf.len() {
            bail!("Request headers exceed {HEADER_BUDGET} bytes");
        }

        let n = client.read(&mut buf[have..]).await?;

        if n == 0 {
            bail!("Client closed before finishing its request");
        }

        have += n;

        if let Some(end) = http::header_end(&buf[..have]) {
            break end;
        }
    };

    buf.truncate(have);

    if buf.starts_with(b"CONNECT ") {
        let target = connect_target(&buf)?;
        let session = Session::connect(&engine, &target).await?;

        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        /* bytes past the headers already belong to the tunneled stream */
        return session.run(&engine, client, buf[end..].to_vec()).await;
    }

    /* plain request: the request itself is the first payload */
    let (host, _) = http::find_host(&buf).ok_or_else(|| anyhow!("Request without a Host"))?;

    let target = split_host_port(&host, 80);
    let session = Session::connect(&engine, &target).await?;

    session.run(&engine, client, buf).await
}

fn connect_target(buf: &[u8]) -> Result<Target> {
    let line = buf
        .split(|&b| b == b'\r')
        .next()
        .ok_or_else(|| anyhow!("Empty CONNECT line"))?;

    let line = std::str::from_utf8(line)?;

    let authority = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("CONNECT without an authority"))?;

    Ok(split_host_port(authority, 443))
}

fn split_host_port(authority: &str, default_port: u16) -> Target {
    /* bracketed IPv6 first, then a trailing :port, then bare host */
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);

            return Target::new(host, port);
        }
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => Target::new(host, port),
            Err(_) => Target::new(authority, default_port),
        },

        _ => Target::new(authority, default_port),
    }
}
