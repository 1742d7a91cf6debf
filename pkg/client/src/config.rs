/// Connection settings for the control plane and block store.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// `host[:port]` of the control-plane API
    pub api_host: String,
    pub api_token: String,
    /// Skip TLS verification
    pub insecure: bool,
    /// Block store base URLs; discovered from the control plane when empty
    pub keep_services: Vec<String>,
    /// Extra CA bundle (PEM) to trust
    pub ca_certs: Option<std::path::PathBuf>,
    /// Attempts per request before giving up
    pub retries: u32,
}

impl ClientConfig {
    /// Read `ARVADOS_API_HOST`, `ARVADOS_API_TOKEN`, `ARVADOS_API_HOST_INSECURE`
    /// and `ARVADOS_KEEP_SERVICES` from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|k| std::env::var(k).ok())
    }

    /// Same as `from_env`, with variables looked up through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let insecure = var("ARVADOS_API_HOST_INSECURE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "TRUE"))
            .unwrap_or(false);
        let keep_services = var("ARVADOS_KEEP_SERVICES")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            api_host: var("ARVADOS_API_HOST").unwrap_or_default(),
            api_token: var("ARVADOS_API_TOKEN").unwrap_or_default(),
            insecure,
            keep_services,
            ca_certs: None,
            retries: 10,
        }
    }

    /// Same settings with a different token.
    pub fn with_token(&self, token: &str) -> Self {
        Self {
            api_token: token.to_string(),
            ..self.clone()
        }
    }

    pub(crate) fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(self.insecure);
        if let Some(path) = &self.ca_certs {
            let pem = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("read CA certs {}: {}", path.display(), e))?;
            for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("ARVADOS_API_HOST", "zzzzz.example.com"),
            ("ARVADOS_API_TOKEN", "secret"),
            ("ARVADOS_API_HOST_INSECURE", "1"),
            ("ARVADOS_KEEP_SERVICES", "http://keep0:25107 http://keep1:25107"),
        ]
        .into_iter()
        .collect();
        let cfg = ClientConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.api_host, "zzzzz.example.com");
        assert!(cfg.insecure);
        assert_eq!(cfg.keep_services.len(), 2);
        assert_eq!(cfg.with_token("other").api_token, "other");
        assert_eq!(cfg.retries, 10);
    }
}
