use anyhow::{bail, Context as _, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ErrorKind;
use crate::time;

type HmacSha256 = Hmac<Sha256>;

/// Token format version.
const TOKEN_VERSION: u32 = 1;

/// Claims carried in a provisioning token.
///
/// Serialized with fixed field order, so a given tuple always produces
/// the same byte sequence before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Format version.
    pub v: u32,
    /// Identity the token is bound to (node name).
    pub n: String,
    /// Absolute expiry, epoch seconds.
    pub exp: i64,
    /// Random nonce, 128 bits hex-encoded.
    pub non: String,
}

/// Successful verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub identity: String,
    /// Seconds of validity remaining at verification time.
    pub remaining_secs: i64,
}

/// Verification failure, mapped onto the shared error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl VerifyError {
    fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Malformed,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for VerifyError {}

/// Mints and verifies HMAC-signed, identity-bound, time-bounded
/// provisioning tokens.
///
/// Token wire format: `base64url(claims-json) "." base64url(hmac)`
/// where the HMAC-SHA256 is computed over the encoded claims segment.
/// The signing key is per-site and loaded once per process; it is
/// never logged.
#[derive(Debug)]
pub struct TokenService {
    key: Vec<u8>,
}

impl TokenService {
    /// Build from a hex-encoded signing key. Fails with `no-key` when
    /// the key is absent or empty.
    pub fn from_hex_key(key_hex: Option<&str>) -> Result<Self> {
        let key_hex = match key_hex {
            Some(k) if !k.trim().is_empty() => k.trim(),
            _ => bail!("no-key: auth.signing_key not configured in secrets"),
        };
        let key = decode_hex(key_hex).context("no-key: auth.signing_key is not valid hex")?;
        Ok(Self { key })
    }

    /// Mint a token bound to `identity`, valid for `validity_secs`
    /// from now. Negative validity produces an already-expired token
    /// (useful only for tests).
    pub fn mint(&self, identity: &str, validity_secs: i64) -> Result<String> {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let claims = TokenClaims {
            v: TOKEN_VERSION,
            n: identity.to_string(),
            exp: time::epoch_now() + validity_secs,
            non: encode_hex(&nonce),
        };
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).context("Failed to serialize token claims")?);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .context("Signing key rejected by HMAC")?;
        mac.update(payload.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", payload, sig))
    }

    /// Verify a token: signature first (constant-time), then expiry.
    /// Clock skew tolerance is zero; clients request enough validity.
    pub fn verify(&self, token: &str) -> std::result::Result<Verified, VerifyError> {
        let claims = self.verify_signed(token)?;

        let remaining = claims.exp - time::epoch_now();
        if remaining <= 0 {
            return Err(VerifyError {
                kind: ErrorKind::Expired,
                message: format!("token for '{}' expired {}s ago", claims.n, -remaining),
            });
        }

        Ok(Verified {
            identity: claims.n,
            remaining_secs: remaining,
        })
    }

    /// Signature and structure checks without the expiry check.
    fn verify_signed(&self, token: &str) -> std::result::Result<TokenClaims, VerifyError> {
        let (payload, sig) = token
            .split_once('.')
            .ok_or_else(|| VerifyError::malformed("expected two dot-separated segments"))?;
        if payload.is_empty() || sig.is_empty() || sig.contains('.') {
            return Err(VerifyError::malformed("expected two dot-separated segments"));
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| VerifyError::malformed("signature segment is not base64url"))?;

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| VerifyError::malformed("signing key rejected by HMAC"))?;
        mac.update(payload.as_bytes());
        if mac.verify_slice(&sig_bytes).is_err() {
            return Err(VerifyError {
                kind: ErrorKind::Unauthorized,
                message: "signature mismatch".to_string(),
            });
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| VerifyError::malformed("payload segment is not base64url"))?;
        let claims: TokenClaims = serde_json::from_slice(&payload_bytes)
            .map_err(|e| VerifyError::malformed(format!("invalid claims: {}", e)))?;
        if claims.v != TOKEN_VERSION {
            return Err(VerifyError::malformed(format!(
                "unsupported token version {}",
                claims.v
            )));
        }

        Ok(claims)
    }
}

/// Decode claims without signature verification, for inspection only.
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let (payload, _sig) = token
        .split_once('.')
        .context("Expected two dot-separated segments")?;
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .context("Payload segment is not base64url")?;
    serde_json::from_slice(&payload_bytes).context("Cannot decode token claims")
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}
