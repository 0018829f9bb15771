use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};
use tokio::net::{TcpListener, TcpStream};

use crate::resolve::Target;
use crate::session::Session;
use crate::Engine;

/// Transparent redirect frontend: the firewall REDIRECTed the flow here;
/// ask the kernel where it was originally headed.
pub async fn serve(engine: Arc<Engine>, listener: TcpListener) -> Result<()> {
    info!("Redirect frontend on {}", listener.local_addr()?);

    loop {
        let (client, peer) = listener.accept().await?;

        if !engine.client_allowed(peer.ip()) {
            info!("Client {peer} is not allowlisted, closing");

            continue;
        }

        let engine = engine.clone();

        tokio::spawn(async move {
            if let Err(e) = handle(engine, client).await {
                debug!("Redirected session from {peer}: {e:#}");
            }
        });
    }
}

async fn handle(engine: Arc<Engine>, client: TcpStream) -> Result<()> {
    let original = original_dst(&client)?;

    let target = Target::new(original.ip().to_string(), original.port());
    let session = Session::connect(&engine, &target).await?;

    session.run(&engine, client, vec![]).await
}

#[cfg(any(target_os = "android", target_os = "linux"))]
pub fn original_dst(stream: &TcpStream) -> Result<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::os::fd::AsRawFd;

    /* netfilter's SO_ORIGINAL_DST, same value on both families */
    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();

    unsafe {
        let mut sin: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        if libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut sin as *mut _ as *mut libc::c_void,
            &mut len,
        ) == 0
        {
            return Ok(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                u16::from_be(sin.sin_port),
            ));
        }

        let mut sin6: libc::sockaddr_in6 = std::mem::zeroed();
        let mut len6 = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;

        if libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            SO_ORIGINAL_DST,
            &mut sin6 as *mut _ as *mut libc::c_void,
            &mut len6,
        ) == 0
        {
            return Ok(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            ));
        }
    }

    Err(anyhow::anyhow!(
        "SO_ORIGINAL_DST: {}",
        std::io::Error::last_os_error()
    ))
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
pub fn original_dst(_stream: &TcpStream) -> Result<SocketAddr> {
    Err(anyhow::anyhow!(
        "Transparent redirect needs the netfilter redirect-lookup interface"
    ))
}
