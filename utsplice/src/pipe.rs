use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const PIPE_BUFFER: usize = 65536;

/// Byte pump between the client and the server streams until either
/// side closes; the close propagates to the other side immediately.
pub async fn pipe_sockets(mut client: TcpStream, mut server: TcpStream) -> Result<()> {
    let mut client_open = true;
    let mut server_open = true;

    let mut client_buf = vec![0u8; PIPE_BUFFER];
    let mut server_buf = vec![0u8; PIPE_BUFFER];

    while client_open && server_open {
        tokio::select! {
            readable = client.readable(), if client_open => {
                readable?;

                match client.try_read(&mut client_buf) {
                    Ok(0) => {
                        client_open = false;

                        if server_open {
                            server.shutdown().await?;
                        }
                    }

                    Ok(n) => server.write_all(&client_buf[..n]).await?,

                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}

                    Err(e) => return Err(e.into()),
                }
            }

            readable = server.readable(), if server_open => {
                readable?;

                match server.try_read(&mut server_buf) {
                    Ok(0) => {
                        server_open = false;

                        if client_open {
                            client.shutdown().await?;
                        }
                    }

                    Ok(n) => client.write_all(&server_buf[..n]).await?,

                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}

                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_bytes_flow_both_ways_and_close_propagates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client_side, server_side) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.map(|(s, _)| s)
        });

        let far_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let far_addr = far_listener.local_addr().unwrap();

        let (far_side, far_peer) = tokio::join!(TcpStream::connect(far_addr), async {
            far_listener.accept().await.map(|(s, _)| s)
        });

        let piping = tokio::spawn(pipe_sockets(server_side.unwrap(), far_side.unwrap()));

        let mut client = client_side.unwrap();
        let mut far = far_peer.unwrap();

        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];

        far.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"pong");

        drop(far);

        let mut rest = vec![];

        client.read_to_end(&mut rest).await.unwrap();

        assert!(rest.is_empty());

        piping.await.unwrap().unwrap();
    }
}
