use anyhow::Result;
use log::debug;

use utcodec::l4::tcp::{Flag, TcpHeader};
use utcodec::SerializeOpts;
use utconfig::{Policy, OPT_NACK, OPT_TTL, OPT_WACK, OPT_WCSUM, OPT_WMD5, OPT_WSEQ};

use crate::raw;
use crate::table::ConnectionInfo;

/* TCP-MD5 signature option: kind 19, length 18, digest zeroed. The
 * kernel on the far side drops it, a signature-blind middlebox accepts
 * the segment as authoritative. */
const MD5SIG_OPTION: [u8; 18] = [
    19, 18, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Craft one decoy segment for the flow, with the policy's evasion bits
/// applied. Pure so the wire layout is testable without a raw socket.
pub fn build_fake_segment(info: &ConnectionInfo, payload: &[u8], policy: &Policy) -> Vec<u8> {
    let mut flags = Flag { inner: 0 };

    flags.set_ack(true);
    flags.set_psh(true);

    let mut tcp = TcpHeader {
        src: info.tcp.src,
        dst: info.tcp.dst,
        seqnum: info.tcp.seqnum,
        acknum: info.tcp.acknum,
        data_offset: 5,
        flags,
        window: info.tcp.window,
        checksum: 0,
        urg_pointer: 0,
        options: vec![],
    };

    if policy.option_mask & OPT_WMD5 != 0 {
        tcp.options.extend_from_slice(&MD5SIG_OPTION);
    }

    if policy.option_mask & OPT_NACK != 0 {
        tcp.flags.set_ack(false);
        tcp.acknum = 0;
    } else if policy.option_mask & OPT_WACK != 0 {
        tcp.acknum = tcp.acknum.wrapping_add(tcp.window as u32);
    }

    if policy.option_mask & OPT_WSEQ != 0 {
        tcp.seqnum = tcp.seqnum.wrapping_sub(1);
    }

    let mut network = info.network.clone();

    if policy.option_mask & OPT_TTL != 0 {
        network.set_hops(policy.ttl);
    }

    let opts = SerializeOpts {
        fix_lengths: true,
        compute_checksums: policy.option_mask & OPT_WCSUM == 0,
    };

    utcodec::encode(&network, &tcp, payload, &opts)
}

/// Fire `count` copies of the decoy at the flow's remote address over a
/// burst-scoped raw socket. Partial bursts count as sent.
pub fn send_fake_segments(
    info: &ConnectionInfo,
    payload: &[u8],
    policy: &Policy,
    count: u32,
) -> Result<()> {
    let packet = build_fake_segment(info, payload, policy);
    let remote = info.network.remote();

    let socket = raw::open_send(info.network.is_v6())?;

    for _ in 0..count {
        raw::send_to(&socket, &packet, remote)?;
    }

    debug!(
        "Injected {count} decoys of {} bytes toward {remote} (mask {:#x})",
        packet.len(),
        policy.option_mask
    );

    Ok(())
}
