use std::net::UdpSocket;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::info;

/// TLS material for the server. When self-signed, the certificate
/// lives in a temporary directory that is deleted on drop (shutdown).
#[derive(Debug)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub fingerprint: String,
    _tempdir: Option<TempDir>,
}

impl TlsMaterial {
    /// Use an operator-provided certificate and key pair.
    pub fn from_paths(cert_path: &Path, key_path: &Path) -> Result<Self> {
        if !cert_path.exists() {
            anyhow::bail!("Certificate not found: {}", cert_path.display());
        }
        if !key_path.exists() {
            anyhow::bail!("Key not found: {}", key_path.display());
        }
        let pem = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read certificate: {}", cert_path.display()))?;
        let fingerprint = fingerprint_from_pem(&pem)?;
        Ok(Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            fingerprint,
            _tempdir: None,
        })
    }

    /// Generate a self-signed certificate for the advertised name,
    /// stored in a temp directory removed at shutdown. The fingerprint
    /// is logged once for trust-on-first-use verification.
    pub fn self_signed(advertised_name: &str) -> Result<Self> {
        let key = KeyPair::generate().context("Failed to generate TLS key pair")?;

        let mut san = vec![advertised_name.to_string(), "localhost".to_string()];
        if let Some(ip) = primary_ip() {
            if !san.contains(&ip) {
                san.push(ip);
            }
        }
        san.push("127.0.0.1".to_string());

        let mut params =
            CertificateParams::new(san).context("Invalid certificate parameters")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, advertised_name);
        dn.push(DnType::OrganizationName, "homestak");
        params.distinguished_name = dn;
        let cert = params
            .self_signed(&key)
            .context("Failed to self-sign certificate")?;

        let fingerprint = fingerprint_from_der(cert.der());

        let tempdir = TempDir::new().context("Failed to create TLS temp directory")?;
        let cert_path = tempdir.path().join("server.crt");
        let key_path = tempdir.path().join("server.key");
        std::fs::write(&cert_path, cert.pem())
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        std::fs::write(&key_path, key.serialize_pem())
            .with_context(|| format!("Failed to write {}", key_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| "Failed to restrict key permissions")?;
        }

        info!(
            name = %advertised_name,
            fingerprint = %fingerprint,
            "Generated self-signed certificate"
        );

        Ok(Self {
            cert_path,
            key_path,
            fingerprint,
            _tempdir: Some(tempdir),
        })
    }
}

/// SHA-256 fingerprint over the DER certificate, colon-separated hex.
fn fingerprint_from_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn fingerprint_from_pem(pem: &[u8]) -> Result<String> {
    let mut reader = std::io::BufReader::new(pem);
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .context("Certificate file contains no certificates")?
        .context("Failed to parse certificate PEM")?;
    Ok(fingerprint_from_der(cert.as_ref()))
}

/// Primary routable IP of this machine. Connects a UDP socket to a
/// documentation address (no traffic is sent) and reads the local
/// address the OS would route through.
pub fn primary_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("198.51.100.1:1").ok()?;
    let addr = socket.local_addr().ok()?.ip().to_string();
    if addr == "0.0.0.0" || addr == "127.0.0.1" {
        return None;
    }
    Some(addr)
}
