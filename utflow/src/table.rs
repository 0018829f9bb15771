use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use utcodec::l3::{Ipv4Header, Ipv6Header, NetworkLayer};
use utcodec::l4::tcp::{Flag, TcpHeader};

/// Snapshot of an established flow, already rotated for sending: writing
/// this record onto the wire produces a plausible outbound segment.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub network: NetworkLayer,
    pub tcp: TcpHeader,
}

impl ConnectionInfo {
    /// Build the outbound-oriented record from a captured SYN-ACK.
    /// The observed segment runs remote→local with `(seq=S, ack=A)`;
    /// our next segment runs local→remote with `(seq=A, ack=S+1)`.
    pub fn from_syn_ack(local: IpAddr, remote: IpAddr, observed: &TcpHeader) -> ConnectionInfo {
        let network = match (local, remote) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                NetworkLayer::V4(Ipv4Header::template(src, dst))
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                NetworkLayer::V6(Ipv6Header::template(src, dst))
            }
            (local, remote) => {
                /* mixed families never reach here, the observer sockets
                 * are opened per family */
                unreachable!("Mixed address families {local}/{remote}");
            }
        };

        ConnectionInfo {
            network,
            tcp: TcpHeader {
                src: observed.dst,
                dst: observed.src,
                seqnum: observed.acknum,
                acknum: observed.seqnum.wrapping_add(1),
                data_offset: 5,
                flags: Flag { inner: 0 },
                window: observed.window,
                checksum: 0,
                urg_pointer: 0,
                options: vec![],
            },
        }
    }

    pub fn local_port(&self) -> u16 {
        self.tcp.src
    }
}

const PORT_SPACE: usize = 65536;

/// At most one live record per (family, local port). A fresh capture for
/// a port still holding a stale record replaces it wholesale.
struct FlowTable {
    v4: Vec<Option<ConnectionInfo>>,
    v6: Vec<Option<ConnectionInfo>>,
}

impl FlowTable {
    fn new() -> FlowTable {
        FlowTable {
            v4: vec![None; PORT_SPACE],
            v6: vec![None; PORT_SPACE],
        }
    }

    fn slot(&mut self, v6: bool, port: u16) -> &mut Option<ConnectionInfo> {
        if v6 {
            &mut self.v6[port as usize]
        } else {
            &mut self.v4[port as usize]
        }
    }
}

/// Shared capture state between the observer loops and the splicers.
pub struct FlowState {
    table: Mutex<FlowTable>,
    interest: Mutex<HashMap<IpAddr, usize>>,
    captured: Notify,
}

impl FlowState {
    pub fn new() -> FlowState {
        FlowState {
            table: Mutex::new(FlowTable::new()),
            interest: Mutex::new(HashMap::new()),
            captured: Notify::new(),
        }
    }

    /// Splicers register the remote address before dialing, so the
    /// observer already cares by the time the SYN leaves the kernel.
    pub fn register_interest(&self, remote: IpAddr) {
        *self.interest.lock().unwrap().entry(remote).or_insert(0) += 1;
    }

    pub fn drop_interest(&self, remote: IpAddr) {
        let mut interest = self.interest.lock().unwrap();

        if let Some(count) = interest.get_mut(&remote) {
            *count -= 1;

            if *count == 0 {
                interest.remove(&remote);
            }
        }
    }

    pub fn interested(&self, remote: &IpAddr) -> bool {
        self.interest.lock().unwrap().contains_key(remote)
    }

    pub fn store(&self, info: ConnectionInfo) {
        let v6 = info.network.is_v6();
        let port = info.local_port();

        *self.table.lock().unwrap().slot(v6, port) = Some(info);

        self.captured.notify_waiters();
    }

    pub fn get(&self, v6: bool, port: u16) -> Option<ConnectionInfo> {
        self.table.lock().unwrap().slot(v6, port).clone()
    }

    pub fn clear(&self, v6: bool, port: u16) {
        *self.table.lock().unwrap().slot(v6, port) = None;
    }

    /// Capture happens-before injection: wait until the observer filed a
    /// record for this port, or give up after `wait` and let the caller
    /// splice transparently.
    pub async fn wait_captured(
        &self,
        v6: bool,
        port: u16,
        wait: Duration,
    ) -> Option<ConnectionInfo> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.captured.notified();

            if let Some(info) = self.get(v6, port) {
                return Some(info);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(v6, port);
            }
        }
    }
}

impl Default for FlowState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed_syn_ack() -> TcpHeader {
        let mut flags = Flag { inner: 0 };

        flags.set_syn(true);
        flags.set_ack(true);

        TcpHeader {
            src: 443,
            dst: 51724,
            seqnum: 1000,
            acknum: 5000,
            data_offset: 5,
            flags,
            window: 29200,
            checksum: 0,
            urg_pointer: 0,
            options: vec![],
        }
    }

    #[test]
    fn test_rotation_invariant() {
        let observed = observed_syn_ack();

        let info = ConnectionInfo::from_syn_ack(
            "10.0.0.2".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
            &observed,
        );

        assert_eq!(info.tcp.seqnum, observed.acknum);
        assert_eq!(info.tcp.acknum, observed.seqnum + 1);
        assert_eq!(info.tcp.src, 51724);
        assert_eq!(info.tcp.dst, 443);
        assert_eq!(info.tcp.window, observed.window);
        assert_eq!(info.network.hops(), 64);
    }

    #[test]
    fn test_seq_rotation_wraps() {
        let mut observed = observed_syn_ack();

        observed.seqnum = u32::MAX;

        let info = ConnectionInfo::from_syn_ack(
            "10.0.0.2".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
            &observed,
        );

        assert_eq!(info.tcp.acknum, 0);
    }

    #[test]
    fn test_store_replaces_stale_record() {
        let state = FlowState::new();
        let observed = observed_syn_ack();

        let local: IpAddr = "10.0.0.2".parse().unwrap();
        let remote: IpAddr = "93.184.216.34".parse().unwrap();

        state.store(ConnectionInfo::from_syn_ack(local, remote, &observed));

        let mut replay = observed.clone();

        replay.seqnum = 7777;
        state.store(ConnectionInfo::from_syn_ack(local, remote, &replay));

        let record = state.get(false, 51724).unwrap();

        assert_eq!(record.tcp.acknum, 7778);
    }

    #[test]
    fn test_family_slots_are_independent() {
        let state = FlowState::new();

        state.store(ConnectionInfo::from_syn_ack(
            "10.0.0.2".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
            &observed_syn_ack(),
        ));

        assert!(state.get(false, 51724).is_some());
        assert!(state.get(true, 51724).is_none());
    }

    #[test]
    fn test_interest_refcounting() {
        let state = FlowState::new();
        let remote: IpAddr = "1.2.3.4".parse().unwrap();

        state.register_interest(remote);
        state.register_interest(remote);
        state.drop_interest(remote);

        assert!(state.interested(&remote));

        state.drop_interest(remote);

        assert!(!state.interested(&remote));
    }

    #[tokio::test]
    async fn test_wait_captured_times_out_without_observer() {
        let state = FlowState::new();

        let got = state
            .wait_captured(false, 40000, Duration::from_millis(20))
            .await;

        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_wait_captured_wakes_on_store() {
        let state = std::sync::Arc::new(FlowState::new());
        let waiter = state.clone();

        let task = tokio::spawn(async move {
            waiter
                .wait_captured(false, 51724, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        state.store(ConnectionInfo::from_syn_ack(
            "10.0.0.2".parse().unwrap(),
            "93.184.216.34".parse().unwrap(),
            &observed_syn_ack(),
        ));

        assert!(task.await.unwrap().is_some());
    }
}
