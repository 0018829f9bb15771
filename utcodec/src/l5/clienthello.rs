const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0;
const NAME_HOST: u8 = 0;

/// Byte range of the SNI hostname inside the ClientHello buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SniSpan {
    pub start: usize,
    pub end: usize,
}

pub fn is_client_hello(buf: &[u8]) -> bool {
    buf.len() > 5 && buf[0] == RECORD_HANDSHAKE && buf[5] == HANDSHAKE_CLIENT_HELLO
}

/// Structural walk down the ClientHello to the server_name extension.
/// Returns the hostname and where its bytes sit in the record, so a
/// caller can split or scramble right through the middle of it.
pub fn find_sni(buf: &[u8]) -> Option<(String, SniSpan)> {
    if !is_client_hello(buf) {
        return None;
    }

    /* record header (5) + handshake header (4) */
    let mut at = 9;

    /* client version + random */
    at += 2 + 32;

    let session_len = *buf.get(at)? as usize;

    at += 1 + session_len;

    let ciphers_len = read_u16(buf, at)? as usize;

    at += 2 + ciphers_len;

    let compression_len = *buf.get(at)? as usize;

    at += 1 + compression_len;

    let extensions_len = read_u16(buf, at)? as usize;

    at += 2;

    let extensions_end = at + extensions_len;

    while at + 4 <= extensions_end.min(buf.len()) {
        let ext_type = read_u16(buf, at)?;
        let ext_len = read_u16(buf, at + 2)? as usize;

        at += 4;

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(buf, at, at + ext_len);
        }

        at += ext_len;
    }

    None
}

fn parse_server_name(buf: &[u8], mut at: usize, end: usize) -> Option<(String, SniSpan)> {
    /* server_name_list length */
    at += 2;

    while at + 3 <= end.min(buf.len()) {
        let name_type = buf[at];
        let name_len = read_u16(buf, at + 1)? as usize;

        at += 3;

        if at + name_len > buf.len() {
            return None;
        }

        if name_type == NAME_HOST {
            let host = std::str::from_utf8(&buf[at..at + name_len]).ok()?;

            return Some((
                host.to_string(),
                SniSpan {
                    start: at,
                    end: at + name_len,
                },
            ));
        }

        at += name_len;
    }

    None
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

#[cfg(test)]
pub(crate) fn build_client_hello(host: &str) -> Vec<u8> {
    let name = host.as_bytes();

    let mut sni_ext = vec![];

    sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni_ext.push(NAME_HOST);
    sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(name);

    let mut extensions = vec![];

    extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = vec![];

    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0xab; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut hello = vec![HANDSHAKE_CLIENT_HELLO];

    hello.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hello.extend_from_slice(&body);

    let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];

    record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
    record.extend_from_slice(&hello);

    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_extraction() {
        let record = build_client_hello("blocked.example");

        let (host, span) = find_sni(&record).unwrap();

        assert_eq!(host, "blocked.example");
        assert_eq!(&record[span.start..span.end], b"blocked.example");
    }

    #[test]
    fn test_not_a_hello() {
        assert!(find_sni(b"GET / HTTP/1.1\r\n\r\n").is_none());
        assert!(find_sni(&[0x16, 0x03, 0x01, 0x00, 0x02, 0x02]).is_none());
        assert!(find_sni(&[]).is_none());
    }

    #[test]
    fn test_truncated_hello_does_not_panic() {
        let mut record = build_client_hello("host.example");

        record.truncate(record.len() - 6);

        assert!(find_sni(&record).is_none());
    }
}
