//! Config surface recognized by the HTTP/1.1 client: global task-queue
//! sizing plus per-server certificate-validation and keep-alive policy.

use std::net::IpAddr;
use std::time::Duration;

/// Global client options (`nshttptaskthreads`).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of task queues, each a single cooperative worker. Must be in
    /// `[1, 64]`. Default 1.
    pub nshttptaskthreads: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { nshttptaskthreads: 1 }
    }
}

impl ClientConfig {
    /// Clamps an out-of-range value the way a config-file loader would
    /// (this crate does not parse config files itself, but still validates
    /// the typed value an embedder hands it).
    pub fn validated(mut self) -> Self {
        self.nshttptaskthreads = self.nshttptaskthreads.clamp(1, 64);
        self
    }
}

/// One `validationexception` rule: `{ip <addr|cidr>} {accept <labels>}`.
#[derive(Debug, Clone)]
pub struct ValidationException {
    pub network: IpNetwork,
    pub accept: Vec<ValidationLabel>,
}

impl ValidationException {
    pub fn matches(&self, ip: IpAddr, reason: ValidationLabel) -> bool {
        self.network.contains(ip) && self.accept.iter().any(|l| *l == ValidationLabel::Any || *l == reason)
    }
}

/// A label from a `validationexception accept` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLabel {
    Any,
    CertificateExpired,
    CertificateUntrusted,
    ChainTooLong,
    SelfSignedCertificate,
}

impl ValidationLabel {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "*" => ValidationLabel::Any,
            "certificate-expired" => ValidationLabel::CertificateExpired,
            "certificate-untrusted" => ValidationLabel::CertificateUntrusted,
            "chain-too-long" => ValidationLabel::ChainTooLong,
            "self-signed-certificate" => ValidationLabel::SelfSignedCertificate,
            _ => return None,
        })
    }
}

/// A minimal IPv4/IPv6 CIDR matcher, just enough for `validationexception`
/// rules; this crate has no need for a general networking library.
#[derive(Debug, Clone, Copy)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix_len }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(candidate)) => {
                let mask = mask_u32(self.prefix_len);
                u32::from(net) & mask == u32::from(candidate) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(candidate)) => {
                let mask = mask_u128(self.prefix_len);
                u128::from(net) & mask == u128::from(candidate) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len.min(32))
    }
}

fn mask_u128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len.min(128))
    }
}

/// Per-server (per `host:port`) options.
#[derive(Debug, Clone)]
pub struct PerServerConfig {
    /// `0s` disables keep-alive (default).
    pub keepalive: Duration,
    pub cafile: Option<std::path::PathBuf>,
    pub capath: Option<std::path::PathBuf>,
    /// Carried for config-surface completeness; read into a path but not
    /// otherwise consumed, so no verification behavior is implemented
    /// against it here either.
    pub invalidcertificates: Vec<std::path::PathBuf>,
    /// When false, a prominent warning is logged.
    pub validatecertificates: bool,
    pub validationexception: Vec<ValidationException>,
    pub validationdepth: u32,
    pub logging: bool,
    pub logfile: Option<std::path::PathBuf>,
    pub logrollfmt: Option<String>,
    /// Default 100.
    pub logmaxbackup: u32,
    pub logroll: bool,
    /// `[0, 23]` when set.
    pub logrollhour: Option<u8>,
    pub logrollonsignal: bool,
}

impl Default for PerServerConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::ZERO,
            cafile: None,
            capath: None,
            invalidcertificates: Vec::new(),
            validatecertificates: true,
            validationexception: Vec::new(),
            validationdepth: 9,
            logging: false,
            logfile: None,
            logrollfmt: None,
            logmaxbackup: 100,
            logroll: false,
            logrollhour: None,
            logrollonsignal: false,
        }
    }
}

impl PerServerConfig {
    /// `TRUST_ALL_IPS` starts set and clears the moment any IP rule is
    /// given: a connection whose peer IP is not named by a rule falls
    /// back to the default of trusting nothing once any rule exists.
    pub fn trust_all_ips(&self) -> bool {
        self.validationexception.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_clamps_thread_count() {
        let cfg = ClientConfig { nshttptaskthreads: 0 }.validated();
        assert_eq!(cfg.nshttptaskthreads, 1);
        let cfg = ClientConfig { nshttptaskthreads: 9000 }.validated();
        assert_eq!(cfg.nshttptaskthreads, 64);
    }

    #[test]
    fn ip_network_matches_cidr() {
        let net = IpNetwork::new("10.0.0.0".parse().unwrap(), 8);
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn trust_all_ips_clears_once_any_rule_exists() {
        let mut cfg = PerServerConfig::default();
        assert!(cfg.trust_all_ips());
        cfg.validationexception.push(ValidationException {
            network: IpNetwork::host("127.0.0.1".parse().unwrap()),
            accept: vec![ValidationLabel::SelfSignedCertificate],
        });
        assert!(!cfg.trust_all_ips());
    }
}
