use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use iprobe::ipv6;
use log::debug;

use utconfig::{Policy, OPT_IPV6};
use utdns::codec::{TYPE_A, TYPE_AAAA};
use utdns::upstream;

use crate::Engine;

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Target {
        Target {
            host: host.into(),
            port,
        }
    }
}

pub struct Resolution {
    /// Hostname the policy applies to, once lies are peeled off.
    pub host: Option<String>,
    pub policy: Option<Arc<Policy>>,
    pub addrs: Vec<IpAddr>,
}

/// Turn a frontend target into real addresses. A literal inside the lie
/// space redeems through the fake-index table; hostnames go through the
/// hosts file, then a policy-aware upstream lookup, then the system
/// resolver.
pub async fn resolve(engine: &Engine, target: &Target) -> Result<Resolution> {
    if let Ok(literal) = target.host.parse::<IpAddr>() {
        if let Some(entry) = engine.table.lookup_addr(literal) {
            debug!("{literal} redeems the lie about {}", entry.host);

            let policy = engine.policies.read().unwrap().lookup(&entry.host);

            return Ok(Resolution {
                host: Some(entry.host),
                policy,
                addrs: entry.addrs,
            });
        }

        return Ok(Resolution {
            host: None,
            policy: None,
            addrs: vec![literal],
        });
    }

    let policy = engine.policies.read().unwrap().lookup(&target.host);

    if let Some(pinned) = engine.hosts.lookup(&target.host) {
        return Ok(Resolution {
            host: Some(target.host.clone()),
            policy,
            addrs: pinned.to_vec(),
        });
    }

    let addrs = match &policy {
        Some(policy) => {
            let qtype = if policy.option_mask & OPT_IPV6 != 0 && ipv6() {
                TYPE_AAAA
            } else {
                TYPE_A
            };

            upstream::nslookup(&engine.upstream, &target.host, qtype, policy.ecs).await?
        }

        None => tokio::net::lookup_host((target.host.as_str(), target.port))
            .await?
            .map(|sa| sa.ip())
            .collect(),
    };

    if addrs.is_empty() {
        return Err(anyhow!("No addresses for {}", target.host));
    }

    Ok(Resolution {
        host: Some(target.host.clone()),
        policy,
        addrs,
    })
}

/// Prefer IPv6 when the host stack carries it, otherwise the first
/// IPv4 answer.
pub fn pick_addr(addrs: &[IpAddr]) -> Result<IpAddr> {
    if ipv6() {
        if let Some(addr) = addrs.iter().find(|a| a.is_ipv6()) {
            return Ok(*addr);
        }
    }

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or(addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("Empty address set"))
}
