use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use utcodec::l5::clienthello;

use crate::resolve::Target;
use crate::session::Session;
use crate::Engine;

const HELLO_BUDGET: usize = 16384;
const TLS_PORT: u16 = 443;

/// Transparent SNI proxy: route on the ClientHello's name without
/// terminating TLS, then replay the hello as the first payload.
pub async fn serve(engine: Arc<Engine>, listener: TcpListener) -> Result<()> {
    info!("SNI frontend on {}", listener.local_addr()?);

    loop {
        let (client, peer) = listener.accept().await?;

        if !engine.client_allowed(peer.ip()) {
            info!("Client {peer} is not allowlisted, closing");

            continue;
        }

        let engine = engine.clone();

        tokio::spawn(async move {
            if let Err(e) = handle(engine, client).await {
                debug!("SNI session from {peer}: {e:#}");
            }
        });
    }
}

async fn handle(engine: Arc<Engine>, mut client: TcpStream) -> Result<()> {
    let hello = read_record(&mut client).await?;

    let (host, _) =
        clienthello::find_sni(&hello).ok_or_else(|| anyhow!("ClientHello without SNI"))?;

    let target = Target::new(host, TLS_PORT);
    let session = Session::connect(&engine, &target).await?;

    session.run(&engine, client, hello).await
}

/// Read until the first TLS record is complete (or the budget is spent,
/// for clients that interleave records).
async fn read_record(client: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; HELLO_BUDGET];
    let mut have = 0;

    loop {
        let n = client.read(&mut buf[have..]).await?;

        if n == 0 {
            bail!("Client closed during the ClientHello");
        }

        have += n;

        if have >= 5 {
            if buf[0] != 0x16 {
                bail!("Not a TLS handshake record");
            }

            let record = 5 + u16::from_be_bytes([buf[3], buf[4]]) as usize;

            if have >= record.min(buf.len()) {
                buf.truncate(have);

                return Ok(buf);
            }
        }

        if have == HELLO_BUDGET {
            buf.truncate(have);

            return Ok(buf);
        }
    }
}
