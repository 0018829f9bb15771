use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};

/// Static name resolution consulted before any DNS traffic happens.
#[derive(Debug, Default)]
pub struct HostsFile {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<HostsFile> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Reading hosts file {:?}", path.as_ref()))?;

        Ok(Self::parse_str(&text))
    }

    pub fn parse_str(text: &str) -> HostsFile {
        let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();

        for raw in text.lines() {
            let line = match raw.find('#') {
                Some(at) => &raw[..at],
                None => raw,
            };

            let mut fields = line.split_whitespace();

            let Some(addr) = fields.next() else { continue };

            let Ok(addr) = addr.parse::<IpAddr>() else {
                continue;
            };

            for host in fields {
                entries
                    .entry(host.to_ascii_lowercase())
                    .or_default()
                    .push(addr);
            }
        }

        HostsFile { entries }
    }

    pub fn lookup(&self, host: &str) -> Option<&[IpAddr]> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let hosts = HostsFile::parse_str(
            "# local overrides\n93.184.216.34 pinned.example www.pinned.example\n::1 six.example\nnot-an-ip host\n",
        );

        assert_eq!(hosts.lookup("pinned.example").unwrap().len(), 1);
        assert_eq!(hosts.lookup("WWW.pinned.example").unwrap().len(), 1);
        assert!(hosts.lookup("six.example").unwrap()[0].is_ipv6());
        assert!(hosts.lookup("host").is_none());
        assert!(hosts.lookup("missing.example").is_none());
    }
}
