//! Throwaway TLS identity for the container gateway.

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use tracing::info;

/// A self-signed certificate generated at supervisor start. Clients
/// don't verify it against a CA; they prove knowledge of the shared
/// secret by signing its DER bytes instead.
pub struct GatewayCert {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_der: Vec<u8>,
    key_pem: String,
}

impl GatewayCert {
    /// Generate a certificate naming `hosts` (DNS names or IP addresses)
    /// as subject alternative names.
    pub fn generate(hosts: &[String]) -> anyhow::Result<Self> {
        info!("[pki] generating gateway certificate for {:?}", hosts);

        let mut params = CertificateParams::new(hosts.to_vec())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "crunch-run gateway");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "crunch-run");

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_der: key_pair.serialize_der(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// DER encoding of the certificate; the input to gateway auth.
    pub fn der(&self) -> &[u8] {
        self.cert_der.as_ref()
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// TLS server configuration presenting this certificate.
    pub fn server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("gateway TLS config: {}", e))?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], key)
            .map_err(|e| anyhow::anyhow!("gateway TLS config: {}", e))?;
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let cert = GatewayCert::generate(&["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
        assert!(!cert.der().is_empty());
        assert!(cert.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem().contains("PRIVATE KEY"));
        cert.server_config().unwrap();
    }

    #[test]
    fn test_each_cert_is_distinct() {
        let hosts = ["localhost".to_string()];
        let a = GatewayCert::generate(&hosts).unwrap();
        let b = GatewayCert::generate(&hosts).unwrap();
        assert_ne!(a.der(), b.der());
    }
}
