use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use glob::Pattern;
use ipnetwork::IpNetwork;

use crate::{
    FAKE_REPEAT_DEFAULT, OPT_HTTP, OPT_IPV6, OPT_NACK, OPT_PRESEND, OPT_SPLIT, OPT_TTL, OPT_WACK,
    OPT_WCSUM, OPT_WMD5, OPT_WSEQ,
};

/// Per-host evasion strategy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub option_mask: u32,
    pub ttl: u8,
    pub repeat: u32,
    pub ecs: Option<IpNetwork>,
    pub fake_records: Vec<IpAddr>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            option_mask: 0,
            ttl: 0,
            repeat: FAKE_REPEAT_DEFAULT,
            ecs: None,
            fake_records: vec![],
        }
    }
}

#[derive(Debug, Default)]
pub struct PolicyStore {
    exact: HashMap<String, Arc<Policy>>,
    wildcards: Vec<(Pattern, Arc<Policy>)>,
}

impl PolicyStore {
    pub fn load(paths: &[impl AsRef<Path>]) -> Result<PolicyStore> {
        let mut store = PolicyStore::default();

        for path in paths {
            let text = std::fs::read_to_string(path.as_ref())
                .with_context(|| format!("Reading config {:?}", path.as_ref()))?;

            store
                .parse_str(&text)
                .with_context(|| format!("Parsing config {:?}", path.as_ref()))?;
        }

        Ok(store)
    }

    /// One directive per line; `#` comments; a blank line closes the
    /// current host block.
    pub fn parse_str(&mut self, text: &str) -> Result<()> {
        let mut hosts: Vec<String> = vec![];
        let mut policy = Policy::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(at) => &raw[..at],
                None => raw,
            }
            .trim();

            if line.is_empty() {
                self.commit(&mut hosts, &mut policy);

                continue;
            }

            if hosts.is_empty() {
                for host in line.split_whitespace() {
                    hosts.push(host.to_ascii_lowercase());
                }

                continue;
            }

            for token in line.split_whitespace() {
                apply_token(&mut policy, token)
                    .with_context(|| format!("Config line {}", lineno + 1))?;
            }
        }

        self.commit(&mut hosts, &mut policy);

        Ok(())
    }

    fn commit(&mut self, hosts: &mut Vec<String>, policy: &mut Policy) {
        if hosts.is_empty() {
            return;
        }

        let shared = Arc::new(std::mem::take(policy));

        for host in hosts.drain(..) {
            if host.starts_with("*.") {
                match Pattern::new(&host) {
                    Ok(pattern) => self.wildcards.push((pattern, shared.clone())),
                    Err(e) => warn!("Skipping unusable wildcard {host}: {e}"),
                }
            } else {
                self.exact.insert(host, shared.clone());
            }
        }
    }

    /// Exact hostname first, then the longest matching suffix, then the
    /// explicit wildcard patterns.
    pub fn lookup(&self, host: &str) -> Option<Arc<Policy>> {
        let host = host.to_ascii_lowercase();
        let host = host.trim_end_matches('.');

        if let Some(policy) = self.exact.get(host) {
            return Some(policy.clone());
        }

        let mut rest = host;

        while let Some(dot) = rest.find('.') {
            rest = &rest[dot + 1..];

            if let Some(policy) = self.exact.get(rest) {
                return Some(policy.clone());
            }
        }

        self.wildcards
            .iter()
            .find(|(pattern, _)| pattern.matches(host))
            .map(|(_, policy)| policy.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

fn apply_token(policy: &mut Policy, token: &str) -> Result<()> {
    if let Ok(addr) = token.parse::<IpAddr>() {
        policy.fake_records.push(addr);

        return Ok(());
    }

    if let Some((key, value)) = token.split_once('=') {
        match key {
            "ttl" => {
                policy.ttl = value.parse().context("ttl value")?;
                policy.option_mask |= OPT_TTL;
            }

            "count" => policy.repeat = value.parse().context("count value")?,

            "ecs" => {
                let network = value
                    .parse::<IpNetwork>()
                    .or_else(|_| value.parse::<IpAddr>().map(IpNetwork::from))
                    .map_err(|_| anyhow!("Bad ecs subnet {value}"))?;

                policy.ecs = Some(network);
            }

            _ => bail!("Unknown option {token}"),
        }

        return Ok(());
    }

    policy.option_mask |= match token {
        "md5" | "wmd5" => OPT_WMD5,
        "nack" => OPT_NACK,
        "wack" => OPT_WACK,
        "wcsum" => OPT_WCSUM,
        "wseq" => OPT_WSEQ,
        "split" => OPT_SPLIT,
        "presend" => OPT_PRESEND,
        "http" => OPT_HTTP,
        "ipv6" => OPT_IPV6,
        _ => bail!("Unknown option {token}"),
    };

    Ok(())
}

use log::warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_parsing() {
        let mut store = PolicyStore::default();

        store
            .parse_str(
                "# test config\nblocked.example\nwcsum ttl=5\n\nother.example\nmd5 nack count=2\n192.0.2.7\n",
            )
            .unwrap();

        let policy = store.lookup("blocked.example").unwrap();

        assert_eq!(policy.option_mask, OPT_WCSUM | OPT_TTL);
        assert_eq!(policy.ttl, 5);
        assert_eq!(policy.repeat, FAKE_REPEAT_DEFAULT);

        let other = store.lookup("other.example").unwrap();

        assert_eq!(other.option_mask, OPT_WMD5 | OPT_NACK);
        assert_eq!(other.repeat, 2);
        assert_eq!(other.fake_records, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_suffix_match_and_override() {
        let mut store = PolicyStore::default();

        store
            .parse_str("example.com\nwcsum\n\ndeep.example.com\nmd5\n")
            .unwrap();

        assert_eq!(
            store.lookup("a.example.com").unwrap().option_mask,
            OPT_WCSUM
        );
        assert_eq!(
            store.lookup("deep.example.com").unwrap().option_mask,
            OPT_WMD5
        );
        assert_eq!(
            store.lookup("x.deep.example.com").unwrap().option_mask,
            OPT_WMD5
        );
        assert!(store.lookup("example.org").is_none());
    }

    #[test]
    fn test_wildcard_entries() {
        let mut store = PolicyStore::default();

        store.parse_str("*.video.example\nsplit\n").unwrap();

        assert!(store.lookup("cdn7.video.example").is_some());
        assert!(store.lookup("video.example").is_none());
    }

    #[test]
    fn test_unknown_token_is_fatal() {
        let mut store = PolicyStore::default();

        assert!(store.parse_str("host.example\nfrobnicate\n").is_err());
    }

    #[test]
    fn test_ecs_accepts_bare_address() {
        let mut store = PolicyStore::default();

        store.parse_str("host.example\necs=203.0.113.9\n").unwrap();

        let policy = store.lookup("host.example").unwrap();

        assert_eq!(policy.ecs.unwrap().prefix(), 32);
    }
}
