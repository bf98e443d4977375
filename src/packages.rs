//! In-memory dependency graph of packages, platforms, tools and boards.
//!
//! The graph is populated from one or more index documents and from the
//! on-disk `packages/` tree. "Installed" is never stored as a flag: it is
//! always derived from directory presence, so external filesystem changes
//! can never leave the graph lying about what is on disk.
//!
//! Layout of the installed tree, relative to the packages directory:
//!
//! ```text
//! {package}/hardware/{architecture}/{version}/   installed platform release
//! {package}/tools/{name}/{version}/              installed tool release
//! ```

use crate::resources::DownloadResource;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A vendor/maintainer namespace.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub name: String,
    pub maintainer: String,
    pub website_url: Option<String>,
    /// Keyed by architecture.
    pub platforms: BTreeMap<String, Platform>,
    /// Keyed by tool name.
    pub tools: BTreeMap<String, Tool>,
}

/// A board-support family within a package, versioned in releases.
#[derive(Debug, Clone, Default)]
pub struct Platform {
    pub package: String,
    pub architecture: String,
    pub name: String,
    pub category: Option<String>,
    /// Keyed by version string.
    pub releases: BTreeMap<String, PlatformRelease>,
}

/// One version of a platform.
#[derive(Debug, Clone)]
pub struct PlatformRelease {
    pub package: String,
    pub architecture: String,
    pub version: String,
    /// Absent for releases discovered on disk but missing from every index.
    pub resource: Option<DownloadResource>,
    /// Board names as advertised by the index.
    pub index_board_names: Vec<String>,
    pub tool_dependencies: Vec<ToolDependency>,
    /// Full board definitions, keyed by board id. Populated from the board
    /// definition file of an installed release.
    pub boards: BTreeMap<String, Board>,
}

/// A versioned build tool required by platforms.
#[derive(Debug, Clone, Default)]
pub struct Tool {
    pub packager: String,
    pub name: String,
    /// Keyed by version string.
    pub releases: BTreeMap<String, ToolRelease>,
}

/// One version of a tool, with one download variant per host OS.
#[derive(Debug, Clone)]
pub struct ToolRelease {
    pub packager: String,
    pub name: String,
    pub version: String,
    pub systems: Vec<ToolSystem>,
}

/// A per-OS download variant of a tool release.
#[derive(Debug, Clone)]
pub struct ToolSystem {
    pub host: String,
    pub resource: DownloadResource,
}

/// A platform's declared dependency on a tool version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDependency {
    pub packager: String,
    pub name: String,
    pub version: String,
}

/// A concrete board definition inside an installed platform release.
#[derive(Debug, Clone, Default)]
pub struct Board {
    pub board_id: String,
    pub name: String,
    /// Raw properties from the board definition file, board prefix stripped.
    pub properties: BTreeMap<String, String>,
}

/// Resolution key for a platform release: no object references, safe to
/// construct per-operation and pass across lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformReference {
    pub package: String,
    pub architecture: String,
    pub version: String,
}

impl std::fmt::Display for PlatformReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.package, self.architecture, self.version)
    }
}

impl std::fmt::Display for PlatformRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.package, self.architecture, self.version)
    }
}

impl std::fmt::Display for ToolRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.packager, self.name, self.version)
    }
}

/// The package map loaded into one instance.
#[derive(Debug, Clone, Default)]
pub struct Packages(pub BTreeMap<String, Package>);

impl Packages {
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn get_or_create_package(&mut self, name: &str) -> &mut Package {
        self.0.entry(name.to_string()).or_insert_with(|| Package {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub fn find_package(&self, name: &str) -> Option<&Package> {
        self.0.get(name)
    }

    pub fn find_platform(&self, package: &str, architecture: &str) -> Option<&Platform> {
        self.0.get(package)?.platforms.get(architecture)
    }

    pub fn find_platform_release(&self, reference: &PlatformReference) -> Option<&PlatformRelease> {
        self.find_platform(&reference.package, &reference.architecture)?
            .releases
            .get(&reference.version)
    }

    pub fn find_tool_release(
        &self,
        packager: &str,
        name: &str,
        version: &str,
    ) -> Option<&ToolRelease> {
        self.0.get(packager)?.tools.get(name)?.releases.get(version)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.0.values().flat_map(|p| p.platforms.values())
    }
}

impl Package {
    pub fn get_or_create_platform(&mut self, architecture: &str) -> &mut Platform {
        let package = self.name.clone();
        self.platforms
            .entry(architecture.to_string())
            .or_insert_with(|| Platform {
                package,
                architecture: architecture.to_string(),
                ..Default::default()
            })
    }

    pub fn get_or_create_tool(&mut self, name: &str) -> &mut Tool {
        let packager = self.name.clone();
        self.tools.entry(name.to_string()).or_insert_with(|| Tool {
            packager,
            name: name.to_string(),
            ..Default::default()
        })
    }
}

impl Platform {
    /// Highest-versioned release known to the graph.
    pub fn latest_release(&self) -> Option<&PlatformRelease> {
        self.releases
            .values()
            .max_by(|a, b| compare_versions(&a.version, &b.version))
    }

    pub fn get_or_create_release(&mut self, version: &str) -> &mut PlatformRelease {
        let (package, architecture) = (self.package.clone(), self.architecture.clone());
        self.releases
            .entry(version.to_string())
            .or_insert_with(|| PlatformRelease {
                package,
                architecture,
                version: version.to_string(),
                resource: None,
                index_board_names: Vec::new(),
                tool_dependencies: Vec::new(),
                boards: BTreeMap::new(),
            })
    }
}

impl Tool {
    pub fn latest_release(&self) -> Option<&ToolRelease> {
        self.releases
            .values()
            .max_by(|a, b| compare_versions(&a.version, &b.version))
    }
}

impl PlatformRelease {
    pub fn reference(&self) -> PlatformReference {
        PlatformReference {
            package: self.package.clone(),
            architecture: self.architecture.clone(),
            version: self.version.clone(),
        }
    }

    pub fn install_dir(&self, packages_dir: &Path) -> PathBuf {
        packages_dir
            .join(&self.package)
            .join("hardware")
            .join(&self.architecture)
            .join(&self.version)
    }

    /// Derived from directory presence, never cached.
    pub fn is_installed(&self, packages_dir: &Path) -> bool {
        self.install_dir(packages_dir).is_dir()
    }
}

impl ToolRelease {
    pub fn install_dir(&self, packages_dir: &Path) -> PathBuf {
        packages_dir
            .join(&self.packager)
            .join("tools")
            .join(&self.name)
            .join(&self.version)
    }

    pub fn is_installed(&self, packages_dir: &Path) -> bool {
        self.install_dir(packages_dir).is_dir()
    }

    /// The download variant matching the running host, if any.
    pub fn host_system(&self) -> Option<&ToolSystem> {
        let accepted = accepted_hosts();
        for host in accepted {
            if let Some(sys) = self.systems.iter().find(|s| s.host == *host) {
                return Some(sys);
            }
        }
        // "all" variants (e.g. scripts) run everywhere.
        self.systems.iter().find(|s| s.host == "all")
    }
}

/// Host triples accepted on the running machine, best match first.
fn accepted_hosts() -> &'static [&'static str] {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        &["x86_64-pc-linux-gnu", "x86_64-linux-gnu"]
    }
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        &["aarch64-linux-gnu", "arm-linux-gnueabihf"]
    }
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        &["arm64-apple-darwin", "x86_64-apple-darwin"]
    }
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        &["x86_64-apple-darwin", "i386-apple-darwin"]
    }
    #[cfg(target_os = "windows")]
    {
        &["x86_64-mingw32", "i686-mingw32"]
    }
    #[cfg(not(any(
        all(target_os = "linux", target_arch = "x86_64"),
        all(target_os = "linux", target_arch = "aarch64"),
        all(target_os = "macos", target_arch = "aarch64"),
        all(target_os = "macos", target_arch = "x86_64"),
        target_os = "windows"
    )))]
    {
        &[]
    }
}

/// Compare two version strings: numeric dot-separated parts first, then a
/// lexicographic tiebreak.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<u32> = a.split('.').filter_map(|s| s.parse().ok()).collect();
    let b_parts: Vec<u32> = b.split('.').filter_map(|s| s.parse().ok()).collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.0.0", "2.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        // numerically equal, shorter string loses the lexicographic tiebreak
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_latest_release() {
        let mut platform = Platform {
            package: "vendora".into(),
            architecture: "arch1".into(),
            ..Default::default()
        };
        platform.get_or_create_release("1.0.0");
        platform.get_or_create_release("1.10.0");
        platform.get_or_create_release("1.9.0");

        assert_eq!(platform.latest_release().unwrap().version, "1.10.0");
    }

    #[test]
    fn test_install_dir_layout() {
        let mut platform = Platform {
            package: "vendora".into(),
            architecture: "arch1".into(),
            ..Default::default()
        };
        let release = platform.get_or_create_release("1.0.0");
        let dir = release.install_dir(Path::new("/data/packages"));
        assert_eq!(
            dir,
            PathBuf::from("/data/packages/vendora/hardware/arch1/1.0.0")
        );
        assert!(!release.is_installed(Path::new("/data/packages")));
    }

    #[test]
    fn test_merge_by_package_name() {
        let mut packages = Packages::default();
        packages
            .get_or_create_package("vendora")
            .get_or_create_platform("arch1")
            .get_or_create_release("1.0.0");
        // A second index source augments the same package.
        packages
            .get_or_create_package("vendora")
            .get_or_create_platform("arch1")
            .get_or_create_release("2.0.0");

        assert_eq!(packages.0.len(), 1);
        let platform = packages.find_platform("vendora", "arch1").unwrap();
        assert_eq!(platform.releases.len(), 2);
        assert_eq!(platform.latest_release().unwrap().version, "2.0.0");
    }
}
