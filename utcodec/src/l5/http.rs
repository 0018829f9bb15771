/// Offset one past the header terminator, if the request is complete.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub fn is_request(buf: &[u8]) -> bool {
    for method in [
        &b"GET "[..],
        b"POST ",
        b"HEAD ",
        b"PUT ",
        b"DELETE ",
        b"OPTIONS ",
        b"CONNECT ",
        b"PATCH ",
        b"TRACE ",
    ] {
        if buf.starts_with(method) {
            return true;
        }
    }

    false
}

/// Value of the Host header, with the byte range of the value so the
/// splitter can cut inside it.
pub fn find_host(buf: &[u8]) -> Option<(String, super::clienthello::SniSpan)> {
    let end = header_end(buf).unwrap_or(buf.len());
    let headers = &buf[..end];

    let mut at = 0;

    for line in headers.split(|&b| b == b'\n') {
        let line_start = at;

        at += line.len() + 1;

        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };

        let name = &line[..colon];

        if !name.eq_ignore_ascii_case(b"host") {
            continue;
        }

        let mut value_start = colon + 1;

        while value_start < line.len() && line[value_start] == b' ' {
            value_start += 1;
        }

        let value = std::str::from_utf8(&line[value_start..]).ok()?;
        let value = value.trim_end();

        if value.is_empty() {
            return None;
        }

        let start = line_start + value_start;

        return Some((
            value.to_string(),
            super::clienthello::SniSpan {
                start,
                end: start + value.len(),
            },
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_header() {
        let req = b"GET /index HTTP/1.1\r\nHost: blocked.example\r\nAccept: */*\r\n\r\n";

        let (host, span) = find_host(req).unwrap();

        assert_eq!(host, "blocked.example");
        assert_eq!(&req[span.start..span.end], b"blocked.example");
    }

    #[test]
    fn test_host_header_case_and_spacing() {
        let req = b"GET / HTTP/1.1\r\nhOsT:   example.org  \r\n\r\n";

        let (host, _) = find_host(req).unwrap();

        assert_eq!(host, "example.org");
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\nHost: x"), None);
    }

    #[test]
    fn test_is_request() {
        assert!(is_request(b"CONNECT host:443 HTTP/1.1\r\n"));
        assert!(is_request(b"GET / HTTP/1.0\r\n"));
        assert!(!is_request(&[0x16, 0x03, 0x01]));
    }
}
