use anyhow::{anyhow, Result};

use crate::csum;
use crate::l3::NetworkLayer;

#[derive(Debug, Clone, Default)]
pub struct Flag {
    pub inner: u8,
}

impl Flag {
    fn set_field_to(&mut self, fnum: u8, val: bool) {
        if val {
            self.inner |= 1 << fnum;
        } else {
            self.inner &= !(1 << fnum);
        }
    }

    fn field(&self, fnum: u8) -> bool {
        self.inner & (1 << fnum) != 0
    }

    pub fn set_urg(&mut self, val: bool) {
        self.set_field_to(5, val);
    }

    pub fn set_ack(&mut self, val: bool) {
        self.set_field_to(4, val);
    }

    pub fn set_psh(&mut self, val: bool) {
        self.set_field_to(3, val);
    }

    pub fn set_rst(&mut self, val: bool) {
        self.set_field_to(2, val);
    }

    pub fn set_syn(&mut self, val: bool) {
        self.set_field_to(1, val);
    }

    pub fn set_fin(&mut self, val: bool) {
        self.set_field_to(0, val);
    }

    pub fn urg(&self) -> bool {
        self.field(5)
    }

    pub fn ack(&self) -> bool {
        self.field(4)
    }

    pub fn psh(&self) -> bool {
        self.field(3)
    }

    pub fn rst(&self) -> bool {
        self.field(2)
    }

    pub fn syn(&self) -> bool {
        self.field(1)
    }

    pub fn fin(&self) -> bool {
        self.field(0)
    }
}

#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src: u16,
    pub dst: u16,
    pub seqnum: u32,
    pub acknum: u32,
    pub data_offset: u8,
    pub flags: Flag,
    pub window: u16,
    pub checksum: u16,
    pub urg_pointer: u16,
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub fn decode(buf: &[u8]) -> Result<TcpHeader> {
        if buf.len() < 20 {
            return Err(anyhow!("TCP header truncated to {} bytes", buf.len()));
        }

        let data_offset = buf[12] >> 4;

        if data_offset < 5 {
            return Err(anyhow!("Malformed TCP data offset {data_offset}"));
        }

        let header_len = data_offset as usize * 4;

        if buf.len() < header_len {
            return Err(anyhow!(
                "TCP data offset {data_offset} points past the buffer"
            ));
        }

        Ok(TcpHeader {
            src: u16::from_be_bytes([buf[0], buf[1]]),
            dst: u16::from_be_bytes([buf[2], buf[3]]),
            seqnum: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            acknum: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_offset,
            flags: Flag { inner: buf[13] },
            window: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
            urg_pointer: u16::from_be_bytes([buf[18], buf[19]]),
            options: buf[20..header_len].to_vec(),
        })
    }

    /// Serialize with a zero checksum field. The checksum is folded in by
    /// the packet-level encoder, which owns the pseudo-header.
    pub fn to_bytes(&self, fix_lengths: bool) -> Vec<u8> {
        let mut options = self.options.clone();

        while options.len() % 4 != 0 {
            options.push(0);
        }

        let data_offset = if fix_lengths {
            5 + (options.len() / 4) as u8
        } else {
            self.data_offset
        };

        let mut header = Vec::with_capacity(20 + options.len());

        header.extend_from_slice(&self.src.to_be_bytes());
        header.extend_from_slice(&self.dst.to_be_bytes());
        header.extend_from_slice(&self.seqnum.to_be_bytes());
        header.extend_from_slice(&self.acknum.to_be_bytes());
        header.push((data_offset & 0x0F) << 4);
        header.push(self.flags.inner);
        header.extend_from_slice(&self.window.to_be_bytes());
        header.extend_from_slice(&[0, 0]);
        header.extend_from_slice(&self.urg_pointer.to_be_bytes());
        header.extend_from_slice(&options);

        header
    }
}

/// TCP checksum of a serialized segment against its pseudo-header.
pub fn pseudo_checksum(net: &NetworkLayer, segment: &[u8]) -> u16 {
    let mut sum = Vec::with_capacity(40 + segment.len());

    match net {
        NetworkLayer::V4(ip) => {
            sum.extend_from_slice(&ip.src.octets());
            sum.extend_from_slice(&ip.dst.octets());
            sum.push(0);
            sum.push(ip.protocol);
            sum.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        }

        NetworkLayer::V6(ip) => {
            sum.extend_from_slice(&ip.src.octets());
            sum.extend_from_slice(&ip.dst.octets());
            sum.extend_from_slice(&(segment.len() as u32).to_be_bytes());
            sum.extend_from_slice(&[0, 0, 0]);
            sum.push(ip.next_header);
        }
    }

    sum.extend_from_slice(segment);

    csum::fold(&sum)
}
