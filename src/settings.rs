//! Read-only configuration source.
//!
//! The core consumes configuration as an opaque key-value store; loading it
//! from files is an external concern. Typed accessors cover the keys the
//! core cares about: directory layout, additional index URLs, locale and
//! the index signature policy.

use crate::error::Result;
use crate::security::{self, IndexSecurity, SignaturePolicy};
use std::collections::HashMap;
use std::path::PathBuf;

/// Default URL of the canonical platform index.
pub const DEFAULT_INDEX_URL: &str = "https://downloads.corium.cc/package_corium_index.json";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Data directory: holds downloaded index files and the `packages/`
    /// tree of installed platforms and tools.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.get("directories.data").unwrap_or("."))
    }

    /// Downloads cache directory.
    pub fn downloads_dir(&self) -> PathBuf {
        self.get("directories.downloads")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("staging"))
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir().join("packages")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir().join("tmp")
    }

    /// User directory: holds user-installed libraries.
    pub fn user_dir(&self) -> Option<PathBuf> {
        self.get("directories.user").map(PathBuf::from)
    }

    pub fn libraries_dir(&self) -> Option<PathBuf> {
        self.user_dir().map(|d| d.join("libraries"))
    }

    /// Directory of libraries bundled with the IDE, if configured.
    pub fn builtin_libraries_dir(&self) -> Option<PathBuf> {
        self.get("directories.builtin.libraries").map(PathBuf::from)
    }

    /// Index URLs to load: the built-in default plus user-configured extras.
    pub fn index_urls(&self) -> Vec<String> {
        let mut urls = vec![
            self.get("board_manager.default_url")
                .unwrap_or(DEFAULT_INDEX_URL)
                .to_string(),
        ];
        if let Some(extra) = self.get("board_manager.additional_urls") {
            urls.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from),
            );
        }
        urls
    }

    pub fn library_index_url(&self) -> String {
        self.get("library_manager.index_url")
            .unwrap_or("https://downloads.corium.cc/library_index.json")
            .to_string()
    }

    pub fn locale(&self) -> Option<&str> {
        self.get("locale")
    }

    pub fn signature_policy(&self) -> SignaturePolicy {
        match self.get("security.signature_policy") {
            Some("always") => SignaturePolicy::Always,
            Some("never") => SignaturePolicy::Never,
            _ => SignaturePolicy::TrustedOriginOnly,
        }
    }

    /// Host whose indexes must carry a valid detached signature under the
    /// `TrustedOriginOnly` policy.
    pub fn trusted_host(&self) -> &str {
        self.get("security.trusted_host")
            .unwrap_or(crate::security::DEFAULT_TRUSTED_HOST)
    }

    /// Base64-encoded ed25519 verifying key for detached signatures.
    pub fn trusted_key(&self) -> &str {
        self.get("security.trusted_key")
            .unwrap_or(crate::security::DEFAULT_TRUSTED_KEY_B64)
    }

    /// Resolve the signature enforcement parameters for index updates.
    pub fn index_security(&self) -> Result<IndexSecurity> {
        Ok(IndexSecurity {
            policy: self.signature_policy(),
            trusted_host: self.trusted_host().to_string(),
            verifying_key: security::load_verifying_key(self.trusted_key())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        Settings::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_index_urls_default_plus_additional() {
        let s = settings(&[(
            "board_manager.additional_urls",
            "https://example.com/a.json, https://example.com/b.json",
        )]);
        let urls = s.index_urls();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0], DEFAULT_INDEX_URL);
        assert_eq!(urls[1], "https://example.com/a.json");
        assert_eq!(urls[2], "https://example.com/b.json");
    }

    #[test]
    fn test_directory_layout() {
        let s = settings(&[
            ("directories.data", "/tmp/corium"),
            ("directories.user", "/home/me/corium"),
        ]);
        assert_eq!(s.packages_dir(), PathBuf::from("/tmp/corium/packages"));
        assert_eq!(s.tmp_dir(), PathBuf::from("/tmp/corium/tmp"));
        assert_eq!(
            s.libraries_dir(),
            Some(PathBuf::from("/home/me/corium/libraries"))
        );
        // downloads falls back under the data dir
        assert_eq!(s.downloads_dir(), PathBuf::from("/tmp/corium/staging"));
    }

    #[test]
    fn test_signature_policy_parsing() {
        assert!(matches!(
            settings(&[]).signature_policy(),
            SignaturePolicy::TrustedOriginOnly
        ));
        assert!(matches!(
            settings(&[("security.signature_policy", "never")]).signature_policy(),
            SignaturePolicy::Never
        ));
        assert!(matches!(
            settings(&[("security.signature_policy", "always")]).signature_policy(),
            SignaturePolicy::Always
        ));
    }
}
