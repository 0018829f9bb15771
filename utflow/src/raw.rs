use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;

use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Raw capture socket for one (device, family). The kernel hands us
/// every inbound TCP packet; IPv4 reads include the IP header, IPv6
/// reads start at the TCP header.
pub fn open_recv(device: &str, local: IpAddr) -> Result<Socket> {
    let domain = if local.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::RAW, Some(Protocol::TCP))
        .context("Opening the raw capture socket")?;

    socket
        .bind(&SockAddr::from(SocketAddr::new(local, 0)))
        .with_context(|| format!("Binding the capture socket to {local}"))?;

    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    socket
        .bind_device(Some(device.as_bytes()))
        .with_context(|| format!("Binding the capture socket to device {device}"))?;

    #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
    let _ = device;

    Ok(socket)
}

pub fn recv_from(socket: &Socket, buf: &mut [u8]) -> Result<(usize, Option<IpAddr>)> {
    /* socket2 wants uninit memory, raw reads never exceed the MTU slot */
    let spare = unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
    };

    let (n, addr) = socket.recv_from(spare)?;

    Ok((n, addr.as_socket().map(|s| s.ip())))
}

/// Injection socket. IPPROTO_RAW implies header-included semantics; the
/// serialized IP header goes out exactly as crafted.
pub fn open_send(v6: bool) -> Result<Socket> {
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };

    let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))
        .context("Opening the raw injection socket")?;

    if !v6 {
        let on: libc::c_int = 1;

        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of_val(&on) as libc::socklen_t,
            )
        };

        if rc != 0 {
            return Err(anyhow!(
                "IP_HDRINCL: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    Ok(socket)
}

pub fn send_to(socket: &Socket, packet: &[u8], remote: IpAddr) -> Result<()> {
    let target = SockAddr::from(SocketAddr::new(remote, 0));

    socket
        .send_to(packet, &target)
        .with_context(|| format!("sendto {remote}"))?;

    Ok(())
}
