use std::net::IpAddr;

use anyhow::{anyhow, bail, Result};
use ipnetwork::IpNetwork;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;

const CLASS_IN: u16 = 1;
const TYPE_OPT: u16 = 41;

/* QR|AA|RCODE=0 for synthesized answers */
const FLAGS_LIE: u16 = 0x8400;

#[derive(Debug)]
pub struct Question {
    pub qname: String,
    pub qtype: u16,
    /* offset one past QTYPE/QCLASS, where the answer section begins */
    pub end: usize,
}

/// Parse the single question of a client query. Questions are written
/// without compression, so a plain label walk suffices.
pub fn parse_query(buf: &[u8]) -> Result<Question> {
    if buf.len() < 12 {
        bail!("DNS query shorter than its header");
    }

    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);

    if qdcount == 0 {
        bail!("DNS query without a question");
    }

    let mut at = 12;
    let mut labels: Vec<String> = vec![];

    loop {
        let len = *buf.get(at).ok_or_else(|| anyhow!("Truncated QNAME"))? as usize;

        at += 1;

        if len == 0 {
            break;
        }

        if len > 63 || at + len > buf.len() {
            bail!("Malformed QNAME label");
        }

        labels.push(
            std::str::from_utf8(&buf[at..at + len])
                .map_err(|_| anyhow!("QNAME is not ASCII"))?
                .to_ascii_lowercase(),
        );

        at += len;
    }

    if at + 4 > buf.len() {
        bail!("Truncated question");
    }

    let qtype = u16::from_be_bytes([buf[at], buf[at + 1]]);

    Ok(Question {
        qname: labels.join("."),
        qtype,
        end: at + 4,
    })
}

fn push_name(out: &mut Vec<u8>, host: &str) {
    for label in host.trim_end_matches('.').split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }

    out.push(0);
}

/// Query for our own upstream lookups, optionally carrying an EDNS
/// client-subnet option so the upstream answers for the right vantage.
pub fn build_query(id: u16, host: &str, qtype: u16, ecs: Option<IpNetwork>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);

    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&u16::to_be_bytes(if ecs.is_some() { 1 } else { 0 }));

    push_name(&mut out, host);

    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());

    if let Some(subnet) = ecs {
        let (family, octets): (u16, Vec<u8>) = match subnet.ip() {
            IpAddr::V4(ip) => (1, ip.octets().to_vec()),
            IpAddr::V6(ip) => (2, ip.octets().to_vec()),
        };

        let keep = (subnet.prefix() as usize + 7) / 8;

        let mut option = Vec::with_capacity(8 + keep);

        option.extend_from_slice(&8u16.to_be_bytes());
        option.extend_from_slice(&((4 + keep) as u16).to_be_bytes());
        option.extend_from_slice(&family.to_be_bytes());
        option.push(subnet.prefix());
        option.push(0);
        option.extend_from_slice(&octets[..keep]);

        out.push(0);
        out.extend_from_slice(&TYPE_OPT.to_be_bytes());
        out.extend_from_slice(&4096u16.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&(option.len() as u16).to_be_bytes());
        out.extend_from_slice(&option);
    }

    out
}

/// Synthesized answer to a client query: its question echoed back,
/// authoritative, RCODE 0, one RR per address, a deliberately short TTL.
pub fn build_lie(query: &[u8], question_end: usize, answers: &[IpAddr], ttl: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(question_end + answers.len() * 28);

    out.extend_from_slice(&query[..2]);
    out.extend_from_slice(&FLAGS_LIE.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&query[12..question_end]);

    for addr in answers {
        /* compression pointer back to the QNAME at offset 12 */
        out.extend_from_slice(&[0xC0, 0x0C]);

        match addr {
            IpAddr::V4(ip) => {
                out.extend_from_slice(&TYPE_A.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&ttl.to_be_bytes());
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&ip.octets());
            }

            IpAddr::V6(ip) => {
                out.extend_from_slice(&TYPE_AAAA.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&ttl.to_be_bytes());
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&ip.octets());
            }
        }
    }

    out
}

fn skip_name(buf: &[u8], mut at: usize) -> Result<usize> {
    loop {
        let len = *buf.get(at).ok_or_else(|| anyhow!("Truncated name"))?;

        if len & 0xC0 == 0xC0 {
            return Ok(at + 2);
        }

        at += 1;

        if len == 0 {
            return Ok(at);
        }

        at += len as usize;
    }
}

/// A/AAAA addresses out of an upstream response, compression included.
pub fn parse_answers(buf: &[u8]) -> Result<Vec<IpAddr>> {
    if buf.len() < 12 {
        bail!("DNS response shorter than its header");
    }

    let rcode = buf[3] & 0x0F;

    if rcode != 0 {
        bail!("Upstream answered with RCODE {rcode}");
    }

    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);

    let mut at = 12;

    for _ in 0..qdcount {
        at = skip_name(buf, at)? + 4;
    }

    let mut addrs = vec![];

    for _ in 0..ancount {
        at = skip_name(buf, at)?;

        if at + 10 > buf.len() {
            bail!("Truncated resource record");
        }

        let rtype = u16::from_be_bytes([buf[at], buf[at + 1]]);
        let rdlen = u16::from_be_bytes([buf[at + 8], buf[at + 9]]) as usize;

        at += 10;

        if at + rdlen > buf.len() {
            bail!("Resource record data runs past the buffer");
        }

        match (rtype, rdlen) {
            (TYPE_A, 4) => {
                let octets: [u8; 4] = buf[at..at + 4].try_into().unwrap();

                addrs.push(IpAddr::from(octets));
            }

            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = buf[at..at + 16].try_into().unwrap();

                addrs.push(IpAddr::from(octets));
            }

            _ => {}
        }

        at += rdlen;
    }

    Ok(addrs)
}
