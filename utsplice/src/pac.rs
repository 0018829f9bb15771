use anyhow::Result;
use log::info;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Fixed PAC responder pointing browsers at the SOCKS frontend.
pub async fn serve(listener: TcpListener, socks: String) -> Result<()> {
    info!("PAC served on {}", listener.local_addr()?);

    let body = format!(
        "function FindProxyForURL(url, host) {{\n    return \"SOCKS5 {socks}; SOCKS {socks}; DIRECT\";\n}}\n"
    );

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/x-ns-proxy-autoconfig\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    loop {
        let (mut client, _) = listener.accept().await?;

        let response = response.clone();

        tokio::spawn(async move {
            let mut scratch = [0u8; 2048];

            /* drain whatever request line came in, then answer anything */
            let _ = client.read(&mut scratch).await;
            let _ = client.write_all(response.as_bytes()).await;
            let _ = client.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_pac_advertises_the_socks_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(serve(listener, "127.0.0.1:1080".to_string()));

        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"GET /proxy.pac HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();

        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("SOCKS5 127.0.0.1:1080"));
    }
}
