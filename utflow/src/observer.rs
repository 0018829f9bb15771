use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};

use utcodec::l4::tcp::TcpHeader;

use crate::table::{ConnectionInfo, FlowState};
use crate::{device, raw};

/// One observer per (device, family), on a blocking thread of the
/// runtime. Open failure kills only this observer; the rest of the
/// engine keeps running.
pub fn spawn(device: String, v6: bool, synack: bool, state: Arc<FlowState>) {
    tokio::task::spawn_blocking(move || {
        let family = if v6 { "IPv6" } else { "IPv4" };

        if let Err(e) = monitor(&device, v6, synack, &state) {
            error!("Flow observer on {device}/{family} is down: {e:#}");
        }
    });
}

fn monitor(device: &str, v6: bool, synack: bool, state: &FlowState) -> Result<()> {
    let local = device::local_addr(device, v6)?;
    let socket = raw::open_recv(device, local)?;

    info!("Observing handshakes on {device} from {local}");

    let mut buf = [0u8; 1500];

    loop {
        let (n, from) = match raw::recv_from(&socket, &mut buf) {
            Ok(read) => read,
            Err(e) => {
                warn!("Capture read on {device}: {e:#}");

                continue;
            }
        };

        let Some(remote) = from else { continue };

        let Some(tcp) = transport_of(v6, &buf[..n]) else {
            continue;
        };

        if !wanted(&tcp, synack) {
            continue;
        }

        /* interest is keyed by the remote peer; the packet's destination
         * port is the local port of the outbound flow */
        if !state.interested(&remote) {
            continue;
        }

        let info = ConnectionInfo::from_syn_ack(local, remote, &tcp);

        debug!(
            "Captured handshake :{} <-> {remote}:{}",
            info.local_port(),
            info.tcp.dst
        );

        state.store(info);
    }
}

/// Raw IPv4 reads carry the IP header; step over it by IHL. IPv6 raw
/// sockets deliver the transport payload directly.
fn transport_of(v6: bool, bytes: &[u8]) -> Option<TcpHeader> {
    let segment = if v6 {
        bytes
    } else {
        let ihl = (*bytes.first()? & 0x0F) as usize * 4;

        if ihl < 20 || bytes.len() <= ihl {
            return None;
        }

        &bytes[ihl..]
    };

    TcpHeader::decode(segment).ok()
}

fn wanted(tcp: &TcpHeader, synack: bool) -> bool {
    tcp.flags.syn() && (!synack || tcp.flags.ack())
}

#[cfg(test)]
mod tests {
    use super::*;
    use utcodec::l3::{Ipv4Header, NetworkLayer};
    use utcodec::l4::tcp::Flag;
    use utcodec::SerializeOpts;

    fn syn_ack_packet() -> Vec<u8> {
        let net = NetworkLayer::V4(Ipv4Header::template(
            "93.184.216.34".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ));

        let mut flags = Flag { inner: 0 };

        flags.set_syn(true);
        flags.set_ack(true);

        let tcp = TcpHeader {
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
        };

        utcodec::encode(&net, &tcp, &[], &SerializeOpts::default())
    }

    #[test]
    fn test_ipv4_header_is_stripped() {
        let packet = syn_ack_packet();

        let tcp = transport_of(false, &packet).unwrap();

        assert_eq!(tcp.src, 443);
        assert_eq!(tcp.dst, 51724);
        assert!(tcp.flags.syn());
    }

    #[test]
    fn test_garbage_is_discarded() {
        assert!(transport_of(false, &[]).is_none());
        assert!(transport_of(false, &[0x45, 1, 2]).is_none());
        assert!(transport_of(true, &[1, 2, 3]).is_none());
    }

    #[test]
    fn test_synack_keying() {
        let packet = syn_ack_packet();
        let tcp = transport_of(false, &packet).unwrap();

        assert!(wanted(&tcp, true));
        assert!(wanted(&tcp, false));

        let mut bare_syn = tcp.clone();

        bare_syn.flags.set_ack(false);

        assert!(!wanted(&bare_syn, true));
        assert!(wanted(&bare_syn, false));

        let mut plain_ack = tcp;

        plain_ack.flags.set_syn(false);

        assert!(!wanted(&plain_ack, false));
    }
}
