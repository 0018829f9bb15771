use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use iprobe::ipv6;
use log::{debug, info, warn};
use tokio::net::UdpSocket;

use utconfig::hosts::HostsFile;
use utconfig::{PolicyStore, OPT_IPV6};

use crate::codec::{self, TYPE_A, TYPE_AAAA};
use crate::fake::FakeIndexTable;
use crate::upstream::{self, Upstream};

const LIE_TTL: u32 = 30;

/// UDP resolver frontend. Policy hosts get synthesized answers that
/// steer the client back through the engine; everything else is relayed
/// verbatim to the upstream.
pub struct DnsLiar {
    socket: Arc<UdpSocket>,
    upstream: Upstream,
    policies: Arc<RwLock<PolicyStore>>,
    hosts: Arc<HostsFile>,
    table: Arc<FakeIndexTable>,
}

impl DnsLiar {
    pub async fn bind(
        listen: &str,
        upstream: Upstream,
        policies: Arc<RwLock<PolicyStore>>,
        hosts: Arc<HostsFile>,
        table: Arc<FakeIndexTable>,
    ) -> Result<DnsLiar> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("Binding the DNS liar to {listen}"))?;

        info!("DNS liar answering on {listen}, upstream {upstream:?}");

        Ok(DnsLiar {
            socket: Arc::new(socket),
            upstream,
            policies,
            hosts,
            table,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        let mut buf = [0u8; 4096];

        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    warn!("DNS read: {e}");

                    continue;
                }
            };

            let query = buf[..n].to_vec();

            let socket = self.socket.clone();
            let upstream = self.upstream.clone();
            let policies = self.policies.clone();
            let hosts = self.hosts.clone();
            let table = self.table.clone();

            tokio::spawn(async move {
                match answer(&upstream, &policies, &hosts, &table, &query).await {
                    Ok(Some(reply)) => {
                        let _ = socket.send_to(&reply, peer).await;
                    }

                    /* the client retries on its own schedule */
                    Ok(None) => {}

                    Err(e) => debug!("Query from {peer} dropped: {e:#}"),
                }
            });
        }
    }
}

async fn answer(
    upstream: &Upstream,
    policies: &RwLock<PolicyStore>,
    hosts: &HostsFile,
    table: &FakeIndexTable,
    query: &[u8],
) -> Result<Option<Vec<u8>>> {
    let question = codec::parse_query(query)?;

    if question.qtype != TYPE_A && question.qtype != TYPE_AAAA {
        return Ok(Some(upstream::forward(upstream, query).await?));
    }

    if let Some(pinned) = hosts.lookup(&question.qname) {
        let answers = of_family(pinned, question.qtype);

        return Ok(Some(codec::build_lie(
            query,
            question.end,
            &answers,
            LIE_TTL,
        )));
    }

    let policy = policies.read().unwrap().lookup(&question.qname);

    let Some(policy) = policy else {
        return Ok(Some(upstream::forward(upstream, query).await?));
    };

    /* resolve the truth first so the lie always has something behind it */
    let want = if policy.option_mask & OPT_IPV6 != 0 && ipv6() {
        TYPE_AAAA
    } else {
        TYPE_A
    };

    let real = upstream::nslookup(upstream, &question.qname, want, policy.ecs).await?;

    let index = table.store(&question.qname, real, &policy.fake_records);

    let answers = if policy.fake_records.is_empty() {
        vec![IpAddr::V4(table.sentinel_for(index))]
    } else {
        policy.fake_records.clone()
    };

    let answers = of_family(&answers, question.qtype);

    debug!(
        "Lying about {} with {} answer(s), index {index}",
        question.qname,
        answers.len()
    );

    Ok(Some(codec::build_lie(
        query,
        question.end,
        &answers,
        LIE_TTL,
    )))
}

fn of_family(addrs: &[IpAddr], qtype: u16) -> Vec<IpAddr> {
    addrs
        .iter()
        .copied()
        .filter(|a| (qtype == TYPE_AAAA) == a.is_ipv6())
        .collect()
}
