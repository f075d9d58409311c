use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Site secrets loaded from `secrets.yaml` in the site directory.
///
/// The engine only reads secrets; rotation and encryption-at-rest are
/// handled outside. Values are redacted from Debug output and never
/// logged.
#[derive(Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub auth: AuthSecrets,
    /// Bearer token protecting the repo endpoints.
    #[serde(default)]
    pub repo_token: Option<String>,
    /// Hypervisor API credentials by host name.
    #[serde(default)]
    pub api_tokens: BTreeMap<String, String>,
}

#[derive(Clone, Default, Deserialize)]
pub struct AuthSecrets {
    /// Hex-encoded HMAC key for provisioning tokens.
    #[serde(default)]
    pub signing_key: Option<String>,
    /// Shared token for site-token posture.
    #[serde(default)]
    pub site_token: Option<String>,
}

impl Secrets {
    pub fn load(site_dir: &Path) -> Result<Self> {
        let path = site_dir.join("secrets.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read secrets: {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid secrets file: {}", path.display()))
    }

    pub fn signing_key(&self) -> Option<&str> {
        self.auth.signing_key.as_deref()
    }

    pub fn api_token(&self, host: &str) -> Option<&str> {
        self.api_tokens.get(host).map(String::as_str)
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("auth.signing_key", &self.auth.signing_key.as_ref().map(|_| "<redacted>"))
            .field("auth.site_token", &self.auth.site_token.as_ref().map(|_| "<redacted>"))
            .field("repo_token", &self.repo_token.as_ref().map(|_| "<redacted>"))
            .field("api_tokens", &format!("{} entries", self.api_tokens.len()))
            .finish()
    }
}
