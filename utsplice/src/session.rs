use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use utconfig::Policy;
use utflow::FlowState;

use crate::resolve::{self, Target};
use crate::{dial, pipe, strategy, Engine};

const FIRST_PAYLOAD_WAIT: Duration = Duration::from_secs(2);

/// Interest and flow-table liveness tied to the splice lifetime, so
/// teardown happens on every exit path.
struct FlowGuard {
    flows: Arc<FlowState>,
    remote: IpAddr,
    local_port: u16,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.flows.drop_interest(self.remote);
        self.flows.clear(self.remote.is_ipv6(), self.local_port);
    }
}

/// An accepted client stream bound to its freshly dialed peer.
pub struct Session {
    server: TcpStream,
    policy: Option<Arc<Policy>>,
    remote: IpAddr,
    local_port: u16,
    _guard: FlowGuard,
}

impl Session {
    /// Resolve, register interest, dial. Interest is on the books before
    /// the kernel's SYN leaves, so the observer cannot miss the handshake.
    pub async fn connect(engine: &Engine, target: &Target) -> Result<Session> {
        let resolution = resolve::resolve(engine, target).await?;
        let remote = resolve::pick_addr(&resolution.addrs)?;

        engine.flows.register_interest(remote);

        let dialed = dial::connect(
            std::net::SocketAddr::new(remote, target.port),
            engine.bind_device.clone(),
        )
        .await;

        let server = match dialed {
            Ok(server) => server,
            Err(e) => {
                engine.flows.drop_interest(remote);

                return Err(e);
            }
        };

        let local_port = server.local_addr().context("Dialed socket address")?.port();

        debug!(
            "Spliced :{local_port} -> {remote}:{} for {:?}",
            target.port, resolution.host
        );

        Ok(Session {
            server,
            policy: resolution.policy,
            remote,
            local_port,
            _guard: FlowGuard {
                flows: engine.flows.clone(),
                remote,
                local_port,
            },
        })
    }

    /// Intercept the first application payload, run the injection
    /// strategy around it, then splice until either side closes.
    /// `prelude` holds client bytes a frontend already consumed.
    pub async fn run(
        mut self,
        engine: &Engine,
        mut client: TcpStream,
        prelude: Vec<u8>,
    ) -> Result<()> {
        let Some(policy) = self.policy.take() else {
            /* no policy, no interception: transparent splice */
            if !prelude.is_empty() {
                self.server.write_all(&prelude).await?;
            }

            return pipe::pipe_sockets(client, self.server).await;
        };

        let payload = if prelude.is_empty() {
            first_payload(&mut client).await
        } else {
            prelude
        };

        let captured = engine
            .flows
            .wait_captured(self.remote.is_ipv6(), self.local_port, engine.capture_wait)
            .await;

        match captured {
            Some(info) if !payload.is_empty() => {
                strategy::execute(&mut self.server, &info, &payload, &policy).await?;
            }

            _ => {
                if captured.is_none() {
                    warn!(
                        "No capture for :{} within {:?}, splicing without injection",
                        self.local_port, engine.capture_wait
                    );
                }

                if !payload.is_empty() {
                    self.server.write_all(&payload).await?;
                }
            }
        }

        pipe::pipe_sockets(client, self.server).await
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

/// Read the client's opening bytes: a whole TLS record for a hello, an
/// HTTP request up to its header terminator, or whatever one read gave
/// us otherwise. Stops early when the budget or the timeout runs out.
async fn first_payload(client: &mut TcpStream) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut payload = vec![0u8; 16384];
    let mut have = 0;

    loop {
        let read = tokio::time::timeout(
            FIRST_PAYLOAD_WAIT,
            client.read(&mut payload[have..]),
        )
        .await;

        match read {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,

            Ok(Ok(n)) => {
                have += n;

                if have == payload.len() {
                    break;
                }

                if incomplete(&payload[..have]) {
                    continue;
                }

                break;
            }
        }
    }

    payload.truncate(have);

    payload
}

fn incomplete(have: &[u8]) -> bool {
    use utcodec::l5::http;

    /* a TLS record announces its own length */
    if have.len() >= 5 && have[0] == 0x16 {
        let record = 5 + u16::from_be_bytes([have[3], have[4]]) as usize;

        return have.len() < record;
    }

    http::is_request(have) && http::header_end(have).is_none()
}
