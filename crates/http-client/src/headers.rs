//! Request header utilities: RFC 3986 host/port parsing, location-string
//! building, and parsing an HTTP/1.1 status line + header block into an
//! ordered, case-insensitive name/value set.
//!
//! Header storage itself is `http::HeaderMap`, which already gives
//! case-insensitive lookup and preserves insertion order across `append`
//! calls, so this module only supplies the wire-format parsing
//! `http::HeaderMap` doesn't do.

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::error::{Error, Result};

/// A parsed host, with its port if one was present on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHost {
    pub host: String,
    pub port: Option<u16>,
}

/// Parses a host (optionally `host:port` or `[v6]:port`) per RFC 3986
/// §3.2.2. `strict` restricts a reg-name to unreserved + `-` + `.`; relaxed
/// mode accepts anything up to `:/?#`.
pub fn parse_host(input: &str, strict: bool) -> Result<ParsedHost> {
    if let Some(rest) = input.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| Error::config("unterminated IPv6 literal"))?;
        let host = format!("[{}]", &rest[..end]);
        let after = &rest[end + 1..];
        let port = parse_optional_port(after)?;
        return Ok(ParsedHost { host, port });
    }

    let (host_part, port) = match input.rfind(':') {
        Some(idx) if input[idx + 1..].chars().all(|c| c.is_ascii_digit()) && !input[idx + 1..].is_empty() => {
            (&input[..idx], Some(input[idx + 1..].parse::<u16>().map_err(|_| Error::config("invalid port"))?))
        }
        Some(idx) if input[idx + 1..].is_empty() => return Err(Error::config("empty port after ':'")),
        _ => (input, None),
    };

    if host_part.is_empty() {
        return Err(Error::config("empty host"));
    }
    if host_part.starts_with('.') {
        return Err(Error::config("reg-name must not start with '.'"));
    }
    if strict && !host_part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return Err(Error::config("reg-name contains characters forbidden in strict mode"));
    }
    if !strict && host_part.contains([':', '/', '?', '#']) {
        return Err(Error::config("reg-name contains a reserved delimiter"));
    }

    Ok(ParsedHost {
        host: host_part.to_string(),
        port,
    })
}

fn parse_optional_port(after: &str) -> Result<Option<u16>> {
    match after.strip_prefix(':') {
        None if after.is_empty() => Ok(None),
        None => Err(Error::config("unexpected trailer after IPv6 literal")),
        Some(digits) if digits.is_empty() => Err(Error::config("empty port after ':'")),
        Some(digits) => digits
            .parse::<u16>()
            .map(Some)
            .map_err(|_| Error::config("invalid port")),
    }
}

/// Builds `[proto://]host[:port]`, bracketing IPv6 literals and omitting
/// the port when it equals `default_port`.
pub fn build_location(proto: Option<&str>, host: &str, port: u16, default_port: u16) -> String {
    let mut out = String::new();
    if let Some(proto) = proto {
        out.push_str(proto);
        out.push_str("://");
    }
    let bracketed = host.contains(':') && !host.starts_with('[');
    if bracketed {
        out.push('[');
        out.push_str(host);
        out.push(']');
    } else {
        out.push_str(host);
    }
    if port != default_port {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out
}

/// A parsed HTTP/1.1 response status line.
#[derive(Debug, Clone, Copy)]
pub struct StatusLine {
    pub major: u8,
    pub minor: u8,
    pub status: StatusCode,
}

/// Parses `HTTP/<major>.<minor> <status> <reason>`.
pub fn parse_status_line(line: &str) -> Result<StatusLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or_else(|| Error::protocol("empty status line"))?;
    let status = parts.next().ok_or_else(|| Error::protocol("missing status code"))?;

    let version = version
        .strip_prefix("HTTP/")
        .ok_or_else(|| Error::protocol("status line missing HTTP/ prefix"))?;
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| Error::protocol("malformed HTTP version"))?;
    let major: u8 = major.parse().map_err(|_| Error::protocol("malformed HTTP major version"))?;
    let minor: u8 = minor.parse().map_err(|_| Error::protocol("malformed HTTP minor version"))?;
    let status: u16 = status.parse().map_err(|_| Error::protocol("malformed status code"))?;
    let status = StatusCode::from_u16(status).map_err(|_| Error::protocol("status code out of range"))?;

    Ok(StatusLine { major, minor, status })
}

/// Parses a CRLF-terminated block of `Name: value` lines (the terminator
/// itself already stripped by the caller) into an ordered header map.
pub fn parse_header_block(block: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for raw_line in block.split("\r\n") {
        if raw_line.is_empty() {
            continue;
        }
        // A line starting with space/tab continues the previous header
        // (obsolete line folding, RFC 7230 §3.2.4); still accepted on
        // receive since rejecting it would break otherwise-working peers.
        if raw_line.starts_with([' ', '\t']) {
            continue;
        }
        let (name, value) = raw_line
            .split_once(':')
            .ok_or_else(|| Error::protocol("header line missing ':'"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| Error::protocol("invalid header name"))?;
        let value =
            HeaderValue::from_str(value.trim()).map_err(|_| Error::protocol("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Locates `\r\n\r\n` (with a warning-level fallback for a lone `\n\n`)
/// in `buf`, returning the index just past the terminator.
pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    if let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") {
        tracing::warn!("response used bare LFLF terminator instead of CRLFCRLF");
        return Some(pos + 2);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_host_and_port() {
        let p = parse_host("example.test:8080", true).unwrap();
        assert_eq!(p.host, "example.test");
        assert_eq!(p.port, Some(8080));
    }

    #[test]
    fn parses_ipv6_literal_with_port() {
        let p = parse_host("[::1]:443", true).unwrap();
        assert_eq!(p.host, "[::1]");
        assert_eq!(p.port, Some(443));
    }

    #[test]
    fn rejects_empty_port() {
        assert!(parse_host("example.test:", true).is_err());
    }

    #[test]
    fn rejects_leading_dot_in_strict_mode() {
        assert!(parse_host(".example.test", true).is_err());
    }

    #[test]
    fn location_roundtrips_with_explicit_port() {
        let loc = build_location(Some("https"), "example.test", 8443, 443);
        assert_eq!(loc, "https://example.test:8443");
        let parsed = parse_host(loc.strip_prefix("https://").unwrap(), true).unwrap();
        assert_eq!(parsed.host, "example.test");
        assert_eq!(parsed.port, Some(8443));
    }

    #[test]
    fn location_omits_default_port() {
        let loc = build_location(Some("https"), "example.test", 443, 443);
        assert_eq!(loc, "https://example.test");
    }

    #[test]
    fn location_brackets_ipv6() {
        let loc = build_location(None, "::1", 80, 80);
        assert_eq!(loc, "[::1]");
    }

    #[test]
    fn status_line_parses_major_minor_and_code() {
        let sl = parse_status_line("HTTP/1.1 200 OK\r\n").unwrap();
        assert_eq!(sl.major, 1);
        assert_eq!(sl.minor, 1);
        assert_eq!(sl.status, StatusCode::OK);
    }

    #[test]
    fn header_block_is_case_insensitive_and_ordered() {
        let headers = parse_header_block("Content-Type: text/plain\r\nX-A: 1\r\nX-A: 2\r\n").unwrap();
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        let vals: Vec<_> = headers.get_all("x-a").iter().collect();
        assert_eq!(vals, vec!["1", "2"]);
    }

    #[test]
    fn finds_headers_end_with_crlfcrlf() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nbody";
        let end = find_headers_end(buf).unwrap();
        assert_eq!(&buf[end..], b"body");
    }
}
