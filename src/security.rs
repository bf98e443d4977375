//! Detached signature verification for index documents.
//!
//! Indexes fetched from the canonical trusted origin carry a detached
//! ed25519 signature in a sibling `.sig` file (base64 text over the exact
//! index bytes). Indexes from other origins are accepted without signature
//! enforcement; that asymmetry is policy, surfaced through
//! [`SignaturePolicy`] rather than hard-coded.

use crate::error::{CoriumError, Result};
use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::path::Path;

/// Host whose indexes must verify against the built-in key by default.
pub const DEFAULT_TRUSTED_HOST: &str = "downloads.corium.cc";

/// Built-in verifying key (base64, 32 bytes).
pub const DEFAULT_TRUSTED_KEY_B64: &str = "WGZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmY=";

/// When to enforce detached signatures on downloaded indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// Enforce only for the configured trusted host.
    #[default]
    TrustedOriginOnly,
    /// Enforce for every index origin.
    Always,
    /// Never enforce.
    Never,
}

impl SignaturePolicy {
    /// Whether an index fetched from `url` must carry a valid signature.
    pub fn requires_signature(&self, url: &str, trusted_host: &str) -> bool {
        match self {
            SignaturePolicy::Always => true,
            SignaturePolicy::Never => false,
            SignaturePolicy::TrustedOriginOnly => {
                url_host(url).is_some_and(|h| h.eq_ignore_ascii_case(trusted_host))
            }
        }
    }
}

/// Signature enforcement parameters resolved from configuration: the
/// policy, the host it applies to and the key indexes verify against.
#[derive(Debug, Clone)]
pub struct IndexSecurity {
    pub policy: SignaturePolicy,
    pub trusted_host: String,
    pub verifying_key: VerifyingKey,
}

/// Extract the host portion of a URL without pulling in a full URL parser.
pub fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    Some(host.split(':').next().unwrap_or(host))
}

/// Decode a base64-encoded ed25519 verifying key.
pub fn load_verifying_key(b64: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(b64.trim())
        .context("decoding verifying key")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("verifying key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| CoriumError::Other(anyhow::anyhow!("invalid verifying key: {e}")))
}

/// Verify `data` against a base64-encoded detached signature.
pub fn verify_detached_signature(data: &[u8], signature_b64: &str, key: &VerifyingKey) -> bool {
    let Ok(sig_bytes) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(data, &signature).is_ok()
}

/// Verify an index file against its sibling signature file.
pub fn verify_signature_file(index: &Path, signature: &Path, key: &VerifyingKey) -> Result<()> {
    let data = std::fs::read(index)?;
    let sig = std::fs::read_to_string(signature)?;
    if verify_detached_signature(&data, &sig, key) {
        Ok(())
    } else {
        Err(CoriumError::SignatureVerificationFailed {
            file: index.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn test_keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn test_detached_signature_roundtrip() {
        let (signing, verifying) = test_keypair();
        let data = b"{\"packages\":[]}";
        let sig = BASE64.encode(signing.sign(data).to_bytes());

        assert!(verify_detached_signature(data, &sig, &verifying));
        assert!(!verify_detached_signature(b"tampered", &sig, &verifying));
        assert!(!verify_detached_signature(data, "not base64!!", &verifying));
    }

    #[test]
    fn test_url_host() {
        assert_eq!(
            url_host("https://downloads.corium.cc/index.json"),
            Some("downloads.corium.cc")
        );
        assert_eq!(url_host("http://example.com:8080/x"), Some("example.com"));
        assert_eq!(url_host("file:///tmp/index.json"), Some(""));
        assert_eq!(url_host("not a url"), None);
    }

    // Signature enforcement is asymmetric on purpose: only the canonical
    // origin is checked under the default policy.
    #[test]
    fn test_policy_asymmetry() {
        let policy = SignaturePolicy::TrustedOriginOnly;
        assert!(policy.requires_signature(
            "https://downloads.corium.cc/package_corium_index.json",
            DEFAULT_TRUSTED_HOST
        ));
        assert!(!policy.requires_signature(
            "https://thirdparty.example.com/package_index.json",
            DEFAULT_TRUSTED_HOST
        ));
        assert!(!policy.requires_signature("file:///tmp/index.json", DEFAULT_TRUSTED_HOST));

        assert!(
            SignaturePolicy::Always
                .requires_signature("https://thirdparty.example.com/x.json", DEFAULT_TRUSTED_HOST)
        );
        assert!(
            !SignaturePolicy::Never.requires_signature(
                "https://downloads.corium.cc/package_corium_index.json",
                DEFAULT_TRUSTED_HOST
            )
        );
    }

    #[test]
    fn test_builtin_key_parses() {
        load_verifying_key(DEFAULT_TRUSTED_KEY_B64).unwrap();
    }
}
