pub mod l3;
pub mod l4;
pub mod l5;

mod csum;

use l3::NetworkLayer;
use l4::tcp::TcpHeader;

pub struct SerializeOpts {
    pub fix_lengths: bool,
    pub compute_checksums: bool,
}

impl Default for SerializeOpts {
    fn default() -> Self {
        SerializeOpts {
            fix_lengths: true,
            compute_checksums: true,
        }
    }
}

/*
 * The TCP checksum is folded against the pseudo-header of whichever
 * network layer is present, even when the caller asked for a broken
 * checksum elsewhere. Middleboxes that verify the IP header but not
 * the TCP one must still see a well-formed IP packet.
 */

pub fn encode(
    net: &NetworkLayer,
    tcp: &TcpHeader,
    payload: &[u8],
    opts: &SerializeOpts,
) -> Vec<u8> {
    let mut segment = tcp.to_bytes(opts.fix_lengths);

    segment.extend_from_slice(payload);

    if opts.compute_checksums {
        let crc = l4::tcp::pseudo_checksum(net, &segment);

        segment[16] = (crc >> 8) as u8;
        segment[17] = crc as u8;
    }

    let mut packet = match net {
        NetworkLayer::V4(ip) => {
            let mut ip = ip.clone();

            if opts.fix_lengths {
                ip.length = (20 + segment.len()) as u16;
            }

            ip.to_bytes()
        }

        NetworkLayer::V6(ip) => {
            let mut ip = ip.clone();

            if opts.fix_lengths {
                ip.payload_length = segment.len() as u16;
            }

            ip.to_bytes()
        }
    };

    packet.extend_from_slice(&segment);

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l4::tcp::Flag;
    use std::net::Ipv4Addr;

    fn sample_flow() -> (NetworkLayer, TcpHeader) {
        let net = NetworkLayer::V4(l3::ipv4::Ipv4Header::template(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(93, 184, 216, 34),
        ));

        let mut flags = Flag { inner: 0 };

        flags.set_ack(true);
        flags.set_psh(true);

        let tcp = TcpHeader {
            src: 43211,
            dst: 443,
            seqnum: 0xdeadbeef,
            acknum: 0x1337,
            data_offset: 5,
            flags,
            window: 64240,
            checksum: 0,
            urg_pointer: 0,
            options: vec![],
        };

        (net, tcp)
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let (net, tcp) = sample_flow();

        let packet = encode(&net, &tcp, b"hello", &SerializeOpts::default());

        let decoded = TcpHeader::decode(&packet[20..]).unwrap();

        assert_eq!(decoded.src, 43211);
        assert_eq!(decoded.dst, 443);
        assert_eq!(decoded.seqnum, 0xdeadbeef);
        assert_eq!(decoded.acknum, 0x1337);
        assert_eq!(decoded.window, 64240);
        assert_eq!(decoded.data_offset, 5);
        assert!(decoded.flags.ack());
        assert!(decoded.flags.psh());
        assert!(!decoded.flags.syn());
    }

    #[test]
    fn test_wcsum_leaves_checksum_wrong() {
        let (net, tcp) = sample_flow();

        let good = encode(&net, &tcp, b"payload", &SerializeOpts::default());
        let bad = encode(
            &net,
            &tcp,
            b"payload",
            &SerializeOpts {
                fix_lengths: true,
                compute_checksums: false,
            },
        );

        let good_crc = u16::from_be_bytes([good[20 + 16], good[20 + 17]]);
        let bad_crc = u16::from_be_bytes([bad[20 + 16], bad[20 + 17]]);

        assert_ne!(good_crc, bad_crc);
        assert_eq!(bad_crc, 0);
    }

    #[test]
    fn test_lengths_are_fixed_up() {
        let (net, tcp) = sample_flow();

        let packet = encode(&net, &tcp, &[0u8; 100], &SerializeOpts::default());

        let total = u16::from_be_bytes([packet[2], packet[3]]);

        assert_eq!(total as usize, packet.len());
        assert_eq!(packet.len(), 20 + 20 + 100);
    }
}
