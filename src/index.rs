//! Serde models for remote index documents.
//!
//! A package index is a JSON document enumerating vendor packages, their
//! platform releases (with boards and tool dependencies) and the tool
//! releases those platforms need, one download variant per host OS. Index
//! documents from different URLs merge into the same in-memory graph; the
//! merge itself lives in the package manager.

use crate::error::{CoriumError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;

/// Root of a package index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageIndex {
    #[serde(default)]
    pub packages: Vec<IndexPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPackage {
    pub name: String,
    #[serde(default)]
    pub maintainer: String,
    #[serde(default, rename = "websiteURL")]
    pub website_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub platforms: Vec<IndexPlatformRelease>,
    #[serde(default)]
    pub tools: Vec<IndexToolRelease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexPlatformRelease {
    #[serde(default)]
    pub name: String,
    pub architecture: String,
    pub version: String,
    #[serde(default)]
    pub category: Option<String>,
    pub url: String,
    pub archive_file_name: String,
    pub checksum: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub boards: Vec<IndexBoard>,
    #[serde(default)]
    pub tools_dependencies: Vec<IndexToolDependency>,
}

/// Board entry as listed in the index: a human name only. Full board
/// definitions come from the installed platform's board definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexBoard {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexToolDependency {
    pub packager: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexToolRelease {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub systems: Vec<IndexToolSystem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexToolSystem {
    pub host: String,
    pub url: String,
    pub archive_file_name: String,
    pub checksum: String,
    #[serde(default)]
    pub size: Option<String>,
}

impl PackageIndex {
    pub fn parse(data: &[u8], source: &str) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| CoriumError::InvalidIndex {
            path: source.to_string(),
            source: e,
        })
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data, &path.display().to_string())
    }
}

/// A parsed `ALGORITHM:hexdigest` checksum as carried by index documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub digest: String,
}

impl FromStr for Checksum {
    type Err = CoriumError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, digest) = s
            .split_once(':')
            .ok_or_else(|| CoriumError::InvalidChecksum(s.to_string()))?;
        if algorithm != "SHA-256" {
            return Err(CoriumError::InvalidChecksum(s.to_string()));
        }
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoriumError::InvalidChecksum(s.to_string()));
        }
        Ok(Self {
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl Checksum {
    /// Stream-hash a file and compare against the expected digest.
    pub fn matches_file(&self, path: &Path) -> Result<bool> {
        use std::io::Read;

        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0; 8192];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()) == self.digest)
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            digest: hex::encode(Sha256::digest(data)),
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SHA-256:{}", self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "packages": [{
            "name": "vendora",
            "maintainer": "Vendor A",
            "websiteURL": "https://vendora.example",
            "platforms": [{
                "name": "Vendor A Boards",
                "architecture": "arch1",
                "version": "1.0.0",
                "category": "Contributed",
                "url": "https://vendora.example/arch1-1.0.0.tar.gz",
                "archiveFileName": "arch1-1.0.0.tar.gz",
                "checksum": "SHA-256:0000000000000000000000000000000000000000000000000000000000000000",
                "size": "12345",
                "boards": [{"name": "Board Z"}],
                "toolsDependencies": [
                    {"packager": "vendora", "name": "toolx", "version": "1.0.0"}
                ]
            }],
            "tools": [{
                "name": "toolx",
                "version": "1.0.0",
                "systems": [{
                    "host": "x86_64-pc-linux-gnu",
                    "url": "https://vendora.example/toolx-1.0.0-linux64.tar.gz",
                    "archiveFileName": "toolx-1.0.0-linux64.tar.gz",
                    "checksum": "SHA-256:0000000000000000000000000000000000000000000000000000000000000000"
                }]
            }]
        }]
    }"#;

    #[test]
    fn test_parse_index() {
        let index = PackageIndex::parse(SAMPLE.as_bytes(), "test").unwrap();
        assert_eq!(index.packages.len(), 1);
        let pkg = &index.packages[0];
        assert_eq!(pkg.name, "vendora");
        assert_eq!(pkg.platforms[0].architecture, "arch1");
        assert_eq!(pkg.platforms[0].tools_dependencies[0].name, "toolx");
        assert_eq!(pkg.tools[0].systems[0].host, "x86_64-pc-linux-gnu");
    }

    #[test]
    fn test_parse_error_carries_source() {
        let err = PackageIndex::parse(b"not json", "broken.json").unwrap_err();
        assert!(matches!(err, CoriumError::InvalidIndex { ref path, .. } if path == "broken.json"));
    }

    #[test]
    fn test_checksum_parse() {
        let c: Checksum = "SHA-256:ABCDEF0000000000000000000000000000000000000000000000000000000000"
            .parse()
            .unwrap();
        assert!(c.digest.starts_with("abcdef"));

        assert!("MD5:d41d8cd98f00b204e9800998ecf8427e"
            .parse::<Checksum>()
            .is_err());
        assert!("garbage".parse::<Checksum>().is_err());
        assert!("SHA-256:tooshort".parse::<Checksum>().is_err());
    }

    #[test]
    fn test_checksum_of_bytes_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello world").unwrap();

        let sum = Checksum::of_bytes(b"hello world");
        assert!(sum.matches_file(&path).unwrap());

        std::fs::write(&path, b"hello corrupted").unwrap();
        assert!(!sum.matches_file(&path).unwrap());
    }
}
