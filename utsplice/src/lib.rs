pub mod dial;
pub mod http;
pub mod pac;
pub mod pipe;
pub mod redir;
pub mod resolve;
pub mod session;
pub mod sni;
pub mod socks;
pub mod strategy;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use utconfig::hosts::HostsFile;
use utconfig::PolicyStore;
use utdns::{FakeIndexTable, Upstream};
use utflow::FlowState;

/// Everything a splice needs, passed explicitly. Tests build one per
/// case with exactly the state the case touches.
pub struct Engine {
    pub flows: Arc<FlowState>,
    pub policies: Arc<RwLock<PolicyStore>>,
    pub hosts: Arc<HostsFile>,
    pub table: Arc<FakeIndexTable>,
    pub upstream: Upstream,
    pub clients: Vec<IpAddr>,
    pub bind_device: Option<String>,
    pub capture_wait: Duration,
}

impl Engine {
    pub fn new(upstream: Upstream) -> Engine {
        Engine {
            flows: Arc::new(FlowState::new()),
            policies: Arc::new(RwLock::new(PolicyStore::default())),
            hosts: Arc::new(HostsFile::parse_str("")),
            table: Arc::new(FakeIndexTable::new()),
            upstream,
            clients: vec![],
            bind_device: None,
            capture_wait: Duration::from_millis(200),
        }
    }

    /// Empty allowlist admits everyone; otherwise exact membership.
    pub fn client_allowed(&self, peer: IpAddr) -> bool {
        self.clients.is_empty() || self.clients.contains(&peer)
    }
}
