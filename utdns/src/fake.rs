use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use ipnetwork::Ipv4Network;

/* 24 bits of index ride inside the sentinel address */
const INDEX_MASK: u32 = 0x00FF_FFFF;

/// True resolutions parked behind the lies. The DNS liar stores the
/// upstream answer here and hands the client a sentinel (or a literal
/// fake record); the splicer trades the connection target back for the
/// stored addresses.
pub struct FakeIndexTable {
    sentinel: Ipv4Network,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next: u32,
    entries: HashMap<u32, Entry>,
    by_literal: HashMap<IpAddr, u32>,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub host: String,
    pub addrs: Vec<IpAddr>,
}

impl FakeIndexTable {
    pub fn new() -> FakeIndexTable {
        /* the historical virtual prefix of this scheme */
        Self::with_sentinel("6.0.0.0/8".parse().unwrap())
    }

    pub fn with_sentinel(sentinel: Ipv4Network) -> FakeIndexTable {
        FakeIndexTable {
            sentinel,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// File a true resolution and return its index. Literal fake records
    /// answered for this host are registered so connections to them find
    /// the same entry. The index space wraps; ancient entries give way.
    pub fn store(&self, host: &str, addrs: Vec<IpAddr>, literals: &[IpAddr]) -> u32 {
        let mut inner = self.inner.lock().unwrap();

        let index = inner.next & INDEX_MASK;

        inner.next = inner.next.wrapping_add(1);

        inner.entries.insert(
            index,
            Entry {
                host: host.to_string(),
                addrs,
            },
        );

        for literal in literals {
            inner.by_literal.insert(*literal, index);
        }

        index
    }

    pub fn get(&self, index: u32) -> Option<Entry> {
        self.inner.lock().unwrap().entries.get(&index).cloned()
    }

    /// Sentinel address encoding an index: prefix octet, then the index
    /// big-endian in the remaining three.
    pub fn sentinel_for(&self, index: u32) -> Ipv4Addr {
        let base = self.sentinel.network().octets();

        Ipv4Addr::new(
            base[0],
            (index >> 16) as u8,
            (index >> 8) as u8,
            index as u8,
        )
    }

    pub fn is_sentinel(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.sentinel.contains(v4),
            IpAddr::V6(_) => false,
        }
    }

    /// Trade a connection target back for the parked entry, whether the
    /// lie was a sentinel or a literal fake record.
    pub fn lookup_addr(&self, addr: IpAddr) -> Option<Entry> {
        if let IpAddr::V4(v4) = addr {
            if self.sentinel.contains(v4) {
                let octets = v4.octets();

                let index = ((octets[1] as u32) << 16)
                    | ((octets[2] as u32) << 8)
                    | octets[3] as u32;

                return self.get(index);
            }
        }

        let index = *self.inner.lock().unwrap().by_literal.get(&addr)?;

        self.get(index)
    }
}

impl Default for FakeIndexTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_round_trip() {
        let table = FakeIndexTable::new();

        let real: Vec<IpAddr> = vec!["93.184.216.34".parse().unwrap()];

        let index = table.store("blocked.example", real.clone(), &[]);
        let sentinel = table.sentinel_for(index);

        assert!(table.is_sentinel(IpAddr::V4(sentinel)));

        let entry = table.lookup_addr(IpAddr::V4(sentinel)).unwrap();

        assert_eq!(entry.host, "blocked.example");
        assert_eq!(entry.addrs, real);
    }

    #[test]
    fn test_literal_fake_record_lookup() {
        let table = FakeIndexTable::new();

        let literal: IpAddr = "192.0.2.7".parse().unwrap();
        let real: Vec<IpAddr> = vec!["203.0.113.80".parse().unwrap()];

        table.store("blocked.example", real.clone(), &[literal]);

        let entry = table.lookup_addr(literal).unwrap();

        assert_eq!(entry.addrs, real);
        assert!(!table.is_sentinel(literal));
    }

    #[test]
    fn test_indexes_are_monotone_and_distinct() {
        let table = FakeIndexTable::new();

        let a = table.store("a.example", vec!["198.51.100.1".parse().unwrap()], &[]);
        let b = table.store("b.example", vec!["198.51.100.2".parse().unwrap()], &[]);

        assert_ne!(a, b);
        assert_ne!(table.sentinel_for(a), table.sentinel_for(b));
    }

    #[test]
    fn test_unknown_addr_misses() {
        let table = FakeIndexTable::new();

        assert!(table.lookup_addr("8.8.8.8".parse().unwrap()).is_none());
        assert!(table.lookup_addr("6.1.2.3".parse().unwrap()).is_none());
    }
}
