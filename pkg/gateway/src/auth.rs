use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Shared-secret handshake values for one gateway certificate.
///
/// A client proves it knows the secret by sending
/// `hex(HMAC(secret, cert DER))`; the gateway proves the same by answering
/// with `hex(HMAC(secret, request auth))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAuth {
    request: String,
    response: String,
}

impl GatewayAuth {
    pub fn new(secret: &str, cert_der: &[u8]) -> anyhow::Result<Self> {
        let request = sign(secret, cert_der)?;
        let response = sign(secret, request.as_bytes())?;
        Ok(Self { request, response })
    }

    /// Expected `X-Arvados-Authorization` value.
    pub fn request(&self) -> &str {
        &self.request
    }

    /// `X-Arvados-Authorization-Response` value.
    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn verify(&self, header: Option<&str>) -> bool {
        header == Some(self.request.as_str())
    }
}

fn sign(secret: &str, data: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("gateway auth key: {}", e))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
