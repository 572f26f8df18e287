//! TLS setup: certificate store construction from `cafile`/`capath`, and
//! the custom server-certificate verifier that implements
//! `validationexception` rules on top of standard webpki validation.
//!
//! The verification seam is `rustls::client::danger::ServerCertVerifier`,
//! which lets a failed webpki verdict be downgraded to an accept when an
//! exception rule covers it, rather than rejecting outright.

use std::io::BufReader;
use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};

use crate::config::{PerServerConfig, ValidationLabel};
use crate::error::{Error, Result};

/// Loads `cafile`/`capath` PEM certificates into a root store. An empty
/// `capath`/`cafile` pair yields an empty store — this crate does not fall
/// back to a bundled or OS trust store; root-of-trust provisioning is the
/// embedder's job via explicit config.
fn load_root_store(cfg: &PerServerConfig) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    let mut load_pem = |bytes: &[u8]| -> Result<()> {
        for cert in rustls_pemfile::certs(&mut BufReader::new(bytes)) {
            let cert = cert.map_err(|e| Error::config(format!("invalid PEM certificate: {e}")))?;
            store
                .add(cert)
                .map_err(|e| Error::config(format!("root store rejected certificate: {e}")))?;
        }
        Ok(())
    };

    if let Some(cafile) = &cfg.cafile {
        let bytes = std::fs::read(cafile).map_err(|e| Error::config(format!("reading cafile: {e}")))?;
        load_pem(&bytes)?;
    }
    if let Some(capath) = &cfg.capath {
        let entries = std::fs::read_dir(capath).map_err(|e| Error::config(format!("reading capath: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::config(format!("reading capath entry: {e}")))?;
            if entry.path().extension().is_some_and(|ext| ext == "pem" || ext == "crt") {
                let bytes = std::fs::read(entry.path()).map_err(|e| Error::config(format!("reading capath cert: {e}")))?;
                load_pem(&bytes)?;
            }
        }
    }
    Ok(store)
}

/// Maps a failed webpki verification onto one of the `validationexception`
/// accept labels, if it corresponds to one at all (protocol errors,
/// malformed certs, etc. never match any label and always propagate).
/// rustls has no dedicated "self-signed" certificate error — an
/// unknown-issuer failure is disambiguated into `self-signed-certificate`
/// vs. `certificate-untrusted` by comparing the leaf's issuer and subject
/// with `x509-parser`.
fn classify(err: &TlsError, end_entity: &CertificateDer<'_>) -> Option<ValidationLabel> {
    match err {
        TlsError::InvalidCertificate(CertificateError::Expired | CertificateError::NotValidYet) => {
            Some(ValidationLabel::CertificateExpired)
        }
        TlsError::InvalidCertificate(CertificateError::UnknownIssuer | CertificateError::BadSignature) => {
            if is_self_signed(end_entity) {
                Some(ValidationLabel::SelfSignedCertificate)
            } else {
                Some(ValidationLabel::CertificateUntrusted)
            }
        }
        _ => None,
    }
}

/// A cert is self-signed iff its issuer and subject DNs are identical.
/// Chain-depth enforcement (`validationdepth`) happens separately, before
/// webpki verification ever runs (see `verify_server_cert` below), since
/// `ChainTooLong` has no corresponding `rustls::CertificateError` variant
/// to classify after the fact.
fn is_self_signed(end_entity: &CertificateDer<'_>) -> bool {
    match x509_parser::parse_x509_certificate(end_entity.as_ref()) {
        Ok((_, cert)) => cert.issuer() == cert.subject(),
        Err(_) => false,
    }
}

/// Wraps the standard webpki verifier and overrides its verdict for a
/// failure that a `validationexception` rule covers for this connection's
/// peer IP. `TRUST_ALL_IPS` (cleared the moment any IP rule exists) is
/// folded into `PerServerConfig::trust_all_ips`.
#[derive(Debug)]
struct ExceptionAwareVerifier {
    inner: Arc<WebPkiServerVerifier>,
    peer_ip: IpAddr,
    cfg: PerServerConfig,
}

impl ExceptionAwareVerifier {
    fn evaluate_exception(&self, label: ValidationLabel, err: TlsError) -> std::result::Result<ServerCertVerified, TlsError> {
        let accepted = if self.cfg.trust_all_ips() {
            // no IP rule given yet: nothing is trusted by exception.
            false
        } else {
            self.cfg
                .validationexception
                .iter()
                .any(|rule| rule.matches(self.peer_ip, label))
        };
        if accepted {
            tracing::debug!(?label, ip = %self.peer_ip, "accepting certificate via validationexception rule");
            Ok(ServerCertVerified::assertion())
        } else {
            Err(err)
        }
    }
}

impl ServerCertVerifier for ExceptionAwareVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        // `validationdepth` (default 9): the number of intermediates
        // plus the leaf must not exceed it. Checked ahead of webpki
        // verification since `rustls::CertificateError` carries no
        // "chain too long" variant to classify after the fact.
        if intermediates.len() + 1 > self.cfg.validationdepth as usize {
            return self.evaluate_exception(ValidationLabel::ChainTooLong, TlsError::General("certificate chain exceeds validationdepth".into()));
        }

        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(err) => {
                let Some(label) = classify(&err, end_entity) else {
                    return Err(err);
                };
                self.evaluate_exception(label, err)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifier that accepts every certificate unconditionally, used only when
/// `validatecertificates = false` (a prominent warning is logged by the
/// caller when this path is taken).
#[derive(Debug)]
struct AcceptAllVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Builds a `rustls::ClientConfig` for one request's connection, wiring in
/// `validatecertificates`, `validationdepth`, and `validationexception`.
/// `peer_ip` is the already-resolved address this connection is about to
/// dial, used to evaluate IP-scoped exception rules.
pub fn build_client_config(cfg: &PerServerConfig, peer_ip: IpAddr) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    if !cfg.validatecertificates {
        tracing::warn!(
            ip = %peer_ip,
            "certificate validation is DISABLED for this server (validatecertificates=false); \
             this connection trusts any peer certificate"
        );
        let verifier = Arc::new(AcceptAllVerifier {
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        });
        return Ok(ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::config(format!("tls protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth());
    }

    let root_store = load_root_store(cfg)?;

    if cfg.validationexception.is_empty() {
        // No exception rules to evaluate on failure: plain webpki
        // verification against the configured root store is enough.
        return Ok(ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::config(format!("tls protocol versions: {e}")))?
            .with_root_certificates(root_store)
            .with_no_client_auth());
    }

    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
        .build()
        .map_err(|e| Error::config(format!("building certificate verifier: {e}")))?;
    let verifier = Arc::new(ExceptionAwareVerifier {
        inner,
        peer_ip,
        cfg: cfg.clone(),
    });
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("tls protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_expiry_regardless_of_leaf_cert() {
        let dummy = CertificateDer::from(vec![0u8; 4]);
        assert_eq!(
            classify(&TlsError::InvalidCertificate(CertificateError::Expired), &dummy),
            Some(ValidationLabel::CertificateExpired)
        );
        assert_eq!(classify(&TlsError::General("boom".to_string()), &dummy), None);
    }

    #[test]
    fn classify_falls_back_to_untrusted_for_unparseable_leaf() {
        let dummy = CertificateDer::from(vec![0u8; 4]);
        assert_eq!(
            classify(&TlsError::InvalidCertificate(CertificateError::UnknownIssuer), &dummy),
            Some(ValidationLabel::CertificateUntrusted)
        );
    }

    #[test]
    fn accept_all_verifier_always_succeeds() {
        let provider = rustls::crypto::ring::default_provider();
        let verifier = AcceptAllVerifier {
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        };
        let cert = CertificateDer::from(vec![0u8; 4]);
        let name = ServerName::try_from("example.test").unwrap();
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());
    }
}
