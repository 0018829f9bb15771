use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use utcodec::l5::{clienthello, http};
use utconfig::{Policy, OPT_HTTP, OPT_PRESEND, OPT_SPLIT};
use utflow::inject::send_fake_segments;
use utflow::ConnectionInfo;

/* decoy host for the anchoring GET, deliberately unrelated */
const PRESEND_HOST: &str = "www.example.com";

/// Where to cut the first payload so the interesting name straddles the
/// boundary: the middle of the SNI for a ClientHello, the middle of the
/// Host value for HTTP, half the payload otherwise.
pub fn split_point(payload: &[u8]) -> usize {
    let span = clienthello::find_sni(payload)
        .map(|(_, span)| span)
        .or_else(|| http::find_host(payload).map(|(_, span)| span));

    match span {
        Some(span) if span.start < payload.len() => {
            (span.start + (span.end - span.start) / 2).min(payload.len() - 1)
        }

        _ => (payload.len() / 2).max(1),
    }
}

fn presend_payload(payload: &[u8], policy: &Policy) -> Vec<u8> {
    if policy.option_mask & OPT_HTTP != 0 {
        return format!(
            "GET / HTTP/1.1\r\nHost: {PRESEND_HOST}\r\nConnection: keep-alive\r\n\r\n"
        )
        .into_bytes();
    }

    /* same length and shape as the real payload, name scribbled out */
    let mut scrambled = payload.to_vec();

    if let Some((_, span)) = clienthello::find_sni(payload) {
        scrambled[span.start..span.end].fill(b'a');
    }

    scrambled
}

/// Run the configured injection around the intercepted first payload,
/// then hand the real bytes to the kernel. Injection failures abort the
/// injection only; the splice continues either way.
pub async fn execute(
    server: &mut TcpStream,
    info: &ConnectionInfo,
    payload: &[u8],
    policy: &Policy,
) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }

    if policy.option_mask & OPT_PRESEND != 0 {
        let anchor = presend_payload(payload, policy);

        if let Err(e) = send_fake_segments(info, &anchor, policy, 1) {
            warn!("Presend aborted: {e:#}");
        }
    }

    let cut = split_point(payload);

    /* decoys first, so the middlebox classifies on them */
    if let Err(e) = send_fake_segments(info, &payload[..cut], policy, policy.repeat) {
        warn!("Injection aborted: {e:#}");
    }

    if policy.option_mask & OPT_SPLIT != 0 && payload.len() > 1 {
        debug!("Splitting the first payload at {cut}");

        server.write_all(&payload[..cut]).await?;
        server.flush().await?;

        /* let the first segment leave before the remainder batches up */
        tokio::time::sleep(Duration::from_millis(1)).await;

        server.write_all(&payload[cut..]).await?;
    } else {
        server.write_all(payload).await?;
    }

    server.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use utcodec::l4::tcp::{Flag, TcpHeader};
    use utconfig::OPT_WCSUM;

    fn sample_info() -> ConnectionInfo {
        let mut flags = Flag { inner: 0 };

        flags.set_syn(true);
        flags.set_ack(true);

        ConnectionInfo::from_syn_ack(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            &TcpHeader {
                src: 443,
                dst: 51724,
                seqnum: 100,
                acknum: 200,
                data_offset: 5,
                flags,
                window: 1024,
                checksum: 0,
                urg_pointer: 0,
                options: vec![],
            },
        )
    }

    #[test]
    fn test_split_point_lands_inside_the_sni() {
        let hello = test_hello("blocked.example");
        let (_, span) = clienthello::find_sni(&hello).unwrap();

        let cut = split_point(&hello);

        assert!(cut > span.start);
        assert!(cut < span.end);
    }

    #[test]
    fn test_split_point_without_a_name() {
        assert_eq!(split_point(&[1, 2, 3, 4]), 2);
        assert_eq!(split_point(&[9]), 1);
    }

    #[test]
    fn test_presend_scrambles_the_sni() {
        let hello = test_hello("blocked.example");
        let policy = Policy::default();

        let anchor = presend_payload(&hello, &policy);

        assert_eq!(anchor.len(), hello.len());
        assert!(!anchor
            .windows(b"blocked.example".len())
            .any(|w| w == b"blocked.example"));
    }

    #[test]
    fn test_presend_http_mode() {
        let policy = Policy {
            option_mask: OPT_HTTP,
            ..Policy::default()
        };

        let anchor = presend_payload(b"whatever", &policy);

        assert!(anchor.starts_with(b"GET / HTTP/1.1"));
    }

    /// The whole payload must reach the peer, split or not, even though
    /// the raw injection itself cannot run unprivileged.
    #[tokio::test]
    async fn test_execute_delivers_the_payload_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server, accepted) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.map(|(s, _)| s)
        });

        let mut server = server.unwrap();
        let mut peer = accepted.unwrap();

        let hello = test_hello("blocked.example");

        let policy = Policy {
            option_mask: OPT_WCSUM | OPT_SPLIT,
            ..Policy::default()
        };

        execute(&mut server, &sample_info(), &hello, &policy)
            .await
            .unwrap();

        let mut got = vec![0u8; hello.len()];

        peer.read_exact(&mut got).await.unwrap();

        assert_eq!(got, hello);
    }

    fn test_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();

        let mut sni = vec![];

        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut extensions = vec![];

        extensions.extend_from_slice(&0u16.to_be_bytes());
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);

        let mut body = vec![];

        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0xab; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut hello = vec![0x01];

        hello.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hello.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];

        record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        record.extend_from_slice(&hello);

        record
    }
}
