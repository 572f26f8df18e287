//! URL parsing for outbound HTTP/1.1 requests: scheme validation,
//! default-port resolution, and origin/absolute request-target
//! construction. Authority/host syntax itself is `headers::parse_host`;
//! this module adds what `url::Url` doesn't give verbatim for wire use.

use crate::error::{Error, Result};
use crate::headers::build_location;

/// A request URL that has already been validated to use `http`/`https`.
#[derive(Debug, Clone)]
pub struct RequestUrl {
    pub https: bool,
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
    raw: url::Url,
}

impl RequestUrl {
    /// Parses `input`, rejecting every scheme but `http`/`https` — no
    /// FTP/file/other scheme support.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = url::Url::parse(input).map_err(|e| Error::config(format!("invalid URL: {e}")))?;
        let https = match raw.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::config(format!("unsupported URL scheme '{other}'"))),
        };
        let host = raw
            .host_str()
            .ok_or_else(|| Error::config("URL has no host"))?
            .to_string();
        let default_port = if https { 443 } else { 80 };
        let port = raw.port().unwrap_or(default_port);

        let mut path_and_query = raw.path().to_string();
        if let Some(q) = raw.query() {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }
        if path_and_query.is_empty() {
            path_and_query.push('/');
        }

        Ok(Self {
            https,
            host,
            port,
            path_and_query,
            raw,
        })
    }

    pub fn default_port(&self) -> u16 {
        if self.https {
            443
        } else {
            80
        }
    }

    /// `host[:port]` in canonical IP-literal-bracketed form, omitting the
    /// default port: the value used to build the auto `Host` header.
    pub fn host_header_value(&self) -> String {
        build_location(None, &self.host, self.port, self.default_port())
    }

    /// Origin-form request-target (`path[?query]`), used on a direct
    /// connection or through a CONNECT tunnel.
    pub fn origin_form_target(&self) -> &str {
        &self.path_and_query
    }

    /// Absolute-form request-target, used when forwarding through a proxy
    /// without a CONNECT tunnel.
    pub fn absolute_form_target(&self) -> String {
        self.raw.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_scheme() {
        assert!(RequestUrl::parse("ftp://example.test/").is_err());
    }

    #[test]
    fn resolves_default_ports() {
        let http = RequestUrl::parse("http://example.test/a").unwrap();
        assert_eq!(http.port, 80);
        let https = RequestUrl::parse("https://example.test/a").unwrap();
        assert_eq!(https.port, 443);
    }

    #[test]
    fn path_and_query_includes_query_string() {
        let u = RequestUrl::parse("https://example.test/search?q=rust").unwrap();
        assert_eq!(u.origin_form_target(), "/search?q=rust");
    }

    #[test]
    fn empty_path_defaults_to_slash() {
        let u = RequestUrl::parse("https://example.test").unwrap();
        assert_eq!(u.origin_form_target(), "/");
    }

    #[test]
    fn host_header_omits_default_port() {
        let u = RequestUrl::parse("https://example.test/a").unwrap();
        assert_eq!(u.host_header_value(), "example.test");
        let u = RequestUrl::parse("https://example.test:8443/a").unwrap();
        assert_eq!(u.host_header_value(), "example.test:8443");
    }
}
