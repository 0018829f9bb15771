use std::net::SocketAddr;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use socket2_ext::{AddressBinding, BindDeviceOption};
use tokio::net::TcpStream;

const SO_BUFFER: usize = 65536;

/// Kernel-owned outbound connection, optionally pinned to the observed
/// device so the handshake crosses the capture socket.
pub async fn connect(addr: SocketAddr, device: Option<String>) -> Result<TcpStream> {
    let stream = tokio::task::spawn_blocking(move || -> Result<std::net::TcpStream> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        if let Some(device) = device {
            socket
                .bind_to_device(BindDeviceOption::v4(&device))
                .with_context(|| format!("Binding the dial socket to {device}"))?;
        }

        socket.set_recv_buffer_size(SO_BUFFER)?;
        socket.set_send_buffer_size(SO_BUFFER)?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;

        socket
            .connect(&addr.into())
            .with_context(|| format!("Connecting to {addr}"))?;

        socket.set_nonblocking(true)?;

        Ok(socket.into())
    })
    .await??;

    Ok(TcpStream::from_std(stream)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_local() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stream, accepted) =
            tokio::join!(connect(addr, None), async { listener.accept().await });

        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_refused_connection_is_an_error() {
        /* nothing listens on the discard port */
        assert!(connect("127.0.0.1:9".parse().unwrap(), None).await.is_err());
    }
}
