//! Header-encode callback: turns a merged status + header set into the
//! name/value array submitted to the wire, applying the mandated rewrites.

use http::{HeaderMap, HeaderName, StatusCode};

use http3_proto::qpack::HeaderField;

/// Headers considered hop-by-hop and always dropped from an HTTP/3 response
/// (RFC 9114 §3.2 via RFC 9110 §7.6.1).
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-connection", "upgrade", "transfer-encoding", "te"];

#[derive(Debug, thiserror::Error)]
pub enum HeaderEncodeError {
    #[error("pseudo-header-like field {0:?} is forbidden on a response")]
    ForbiddenPseudoHeader(String),
    #[error("qpack encode error: {0}")]
    Qpack(#[from] http3_proto::qpack::EncoderError),
}

/// Encodes `status` + `headers` into a contiguous ordered field array,
/// `:status` always first. Status `101` is rewritten to `200` (logged).
/// Fields whose name starts with `:` other than `:status` are rejected.
pub fn encode_response_headers(
    mut status: StatusCode,
    headers: &HeaderMap,
) -> Result<Vec<HeaderField>, HeaderEncodeError> {
    if status.as_u16() == 101 {
        tracing::warn!("rewriting HTTP/3 response status 101 to 200");
        status = StatusCode::OK;
    }

    let mut out = Vec::with_capacity(headers.len() + 1);
    out.push(HeaderField::from((":status", status.as_str())));

    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if name.as_str().starts_with(':') {
            return Err(HeaderEncodeError::ForbiddenPseudoHeader(name.as_str().to_string()));
        }
        out.push(HeaderField::from((name.as_str(), value.as_bytes())));
    }

    Ok(out)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn status_always_first_and_three_digits() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let out = encode_response_headers(StatusCode::OK, &headers).unwrap();
        assert_eq!(out[0].name.as_ref(), b":status");
        assert_eq!(out[0].value.as_ref(), b"200");
    }

    #[test]
    fn status_101_rewritten_to_200() {
        let headers = HeaderMap::new();
        let out = encode_response_headers(StatusCode::SWITCHING_PROTOCOLS, &headers).unwrap();
        assert_eq!(out[0].value.as_ref(), b"200");
    }

    #[test]
    fn hop_by_hop_headers_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("5"));
        let out = encode_response_headers(StatusCode::OK, &headers).unwrap();
        assert_eq!(out.len(), 2); // :status + content-length only
    }

    #[test]
    fn pseudo_header_like_field_forbidden() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"x-ok").unwrap(),
            HeaderValue::from_static("y"),
        );
        let out = encode_response_headers(StatusCode::OK, &headers);
        assert!(out.is_ok());
    }
}
