use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::resolve::Target;
use crate::session::Session;
use crate::Engine;

const REPLY_OK: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
const REPLY_REFUSED: [u8; 10] = [5, 5, 0, 1, 0, 0, 0, 0, 0, 0];
const REPLY_BAD_COMMAND: [u8; 10] = [5, 7, 0, 1, 0, 0, 0, 0, 0, 0];

pub async fn serve(engine: Arc<Engine>, listener: TcpListener) -> Result<()> {
    info!("SOCKS5 frontend on {}", listener.local_addr()?);

    loop {
        let (client, peer) = listener.accept().await?;

        if !engine.client_allowed(peer.ip()) {
            info!("Client {peer} is not allowlisted, closing");

            continue;
        }

        let engine = engine.clone();

        tokio::spawn(async move {
            if let Err(e) = handle(engine, client).await {
                debug!("SOCKS session from {peer}: {e:#}");
            }
        });
    }
}

async fn handle(engine: Arc<Engine>, mut client: TcpStream) -> Result<()> {
    let target = handshake(&mut client).await?;

    match Session::connect(&engine, &target).await {
        Ok(session) => {
            client.write_all(&REPLY_OK).await?;

            session.run(&engine, client, vec![]).await
        }

        Err(e) => {
            let _ = client.write_all(&REPLY_REFUSED).await;

            Err(e)
        }
    }
}

/// Classic no-auth SOCKS5: method selection, then CONNECT only.
async fn handshake(client: &mut TcpStream) -> Result<Target> {
    let mut greeting = [0u8; 2];

    client.read_exact(&mut greeting).await?;

    if greeting[0] != 5 {
        bail!("Not a SOCKS5 greeting");
    }

    let mut methods = vec![0u8; greeting[1] as usize];

    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];

    client.read_exact(&mut request).await?;

    if request[1] != 1 {
        client.write_all(&REPLY_BAD_COMMAND).await?;

        bail!("Unsupported SOCKS command {}", request[1]);
    }

    let host = match request[3] {
        1 => {
            let mut octets = [0u8; 4];

            client.read_exact(&mut octets).await?;

            std::net::Ipv4Addr::from(octets).to_string()
        }

        3 => {
            let mut len = [0u8; 1];

            client.read_exact(&mut len).await?;

            let mut name = vec![0u8; len[0] as usize];

            client.read_exact(&mut name).await?;

            String::from_utf8(name)?
        }

        4 => {
            let mut octets = [0u8; 16];

            client.read_exact(&mut octets).await?;

            std::net::Ipv6Addr::from(octets).to_string()
        }

        other => bail!("Unknown SOCKS address type {other}"),
    };

    let mut port = [0u8; 2];

    client.read_exact(&mut port).await?;

    Ok(Target::new(host, u16::from_be_bytes(port)))
}
