//! Package manager: owns the dependency graph and the on-disk layout.
//!
//! One `PackageManager` belongs to one instance. It merges index documents
//! into the graph, loads installed hardware and bundled tools from disk,
//! answers dependency and installed-state queries, and performs the
//! download/install/uninstall primitives the orchestrator composes into
//! transactions.

use crate::error::{CoriumError, Result};
use crate::events::ProgressSink;
use crate::fqbn;
use crate::index::{Checksum, PackageIndex};
use crate::packages::{
    Packages, PlatformReference, PlatformRelease, ToolRelease, ToolSystem, compare_versions,
};
use crate::resources::{self, DownloadResource};
use crate::security::{self, IndexSecurity};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PackageManager {
    data_dir: PathBuf,
    packages_dir: PathBuf,
    downloads_dir: PathBuf,
    tmp_dir: PathBuf,
    pub packages: Packages,
    client: reqwest::Client,
}

impl PackageManager {
    pub fn new(
        data_dir: PathBuf,
        packages_dir: PathBuf,
        downloads_dir: PathBuf,
        tmp_dir: PathBuf,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(format!("corium/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            data_dir,
            packages_dir,
            downloads_dir,
            tmp_dir,
            packages: Packages::default(),
            client,
        })
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Drop all in-memory graph state. Re-initialization calls this first so
    /// entries for platforms uninstalled since the last load never resurface.
    pub fn clear(&mut self) {
        self.packages.clear();
    }

    /// Where the cached copy of a remote index lives inside the data dir.
    pub fn index_file_for_url(&self, url: &str) -> Result<PathBuf> {
        let rest = url
            .split_once("://")
            .ok_or_else(|| CoriumError::InvalidUrl(url.to_string()))?
            .1;
        let base = rest
            .rsplit('/')
            .next()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| CoriumError::InvalidUrl(url.to_string()))?;
        Ok(self.data_dir.join(base))
    }

    /// Parse and merge the index behind `url` into the graph.
    ///
    /// `file://` URLs are read in place; remote URLs are read from their
    /// cached copy in the data dir (see [`Self::update_index`]).
    pub fn load_package_index(&mut self, url: &str) -> Result<()> {
        let path = self.local_index_path(url)?;
        if !path.exists() {
            return Err(CoriumError::NotFound(format!(
                "index file for {url} not present, update the index first"
            )));
        }
        let index = PackageIndex::load_from_file(&path)?;
        self.merge_index(index);
        Ok(())
    }

    fn local_index_path(&self, url: &str) -> Result<PathBuf> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| CoriumError::InvalidUrl(url.to_string()))?;
        match scheme {
            "file" => Ok(PathBuf::from(rest)),
            "http" | "https" => self.index_file_for_url(url),
            _ => Err(CoriumError::InvalidUrl(url.to_string())),
        }
    }

    /// Refresh the cached copy of a remote index: download to a temp dir,
    /// verify the detached signature when the policy requires it, validate
    /// the document parses, then move it into the data dir.
    pub async fn update_index(
        &self,
        url: &str,
        sec: &IndexSecurity,
        sink: &ProgressSink,
    ) -> Result<()> {
        let (scheme, _) = url
            .split_once("://")
            .ok_or_else(|| CoriumError::InvalidUrl(url.to_string()))?;
        if scheme == "file" {
            // Local indexes are used in place; just validate them.
            let path = self.local_index_path(url)?;
            PackageIndex::load_from_file(&path)?;
            return Ok(());
        }

        let staging = tempfile::tempdir().context("creating index staging dir")?;
        let tmp_index = staging.path().join("index.json");

        sink.task_started(format!("Updating index: {url}"));
        resources::fetch_to_file(&self.client, url, &tmp_index).await?;

        if sec.policy.requires_signature(url, &sec.trusted_host) {
            let sig_url = format!("{url}.sig");
            let tmp_sig = staging.path().join("index.json.sig");
            resources::fetch_to_file(&self.client, &sig_url, &tmp_sig).await?;
            security::verify_signature_file(&tmp_index, &tmp_sig, &sec.verifying_key)?;

            let dest_sig = self.index_file_for_url(&sig_url)?;
            fs::create_dir_all(&self.data_dir)?;
            fs::copy(&tmp_sig, &dest_sig)?;
        }

        // Reject documents that do not even parse before replacing the
        // previous cached copy.
        PackageIndex::load_from_file(&tmp_index)?;

        let dest = self.index_file_for_url(url)?;
        fs::create_dir_all(&self.data_dir)?;
        fs::copy(&tmp_index, &dest)?;
        sink.task_completed(format!("Updated index: {url}"));
        Ok(())
    }

    /// Merge an index document into the graph. Sources merge by package
    /// name: later URLs augment earlier ones, they never replace them.
    pub fn merge_index(&mut self, index: PackageIndex) {
        for idx_pkg in index.packages {
            let package = self.packages.get_or_create_package(&idx_pkg.name);
            if package.maintainer.is_empty() {
                package.maintainer = idx_pkg.maintainer.clone();
            }
            if package.website_url.is_none() {
                package.website_url = idx_pkg.website_url.clone();
            }

            for idx_platform in idx_pkg.platforms {
                let checksum = match Checksum::from_str(&idx_platform.checksum) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(
                            platform = %idx_platform.architecture,
                            version = %idx_platform.version,
                            error = %e,
                            "skipping platform release with bad checksum"
                        );
                        continue;
                    }
                };
                let platform = package.get_or_create_platform(&idx_platform.architecture);
                if platform.name.is_empty() {
                    platform.name = idx_platform.name.clone();
                }
                if platform.category.is_none() {
                    platform.category = idx_platform.category.clone();
                }
                let release = platform.get_or_create_release(&idx_platform.version);
                release.resource = Some(DownloadResource {
                    url: idx_platform.url,
                    archive_file_name: idx_platform.archive_file_name,
                    checksum,
                    cache_path: "packages".to_string(),
                    size: idx_platform.size.and_then(|s| s.parse().ok()),
                });
                release.index_board_names =
                    idx_platform.boards.into_iter().map(|b| b.name).collect();
                release.tool_dependencies = idx_platform
                    .tools_dependencies
                    .into_iter()
                    .map(|d| crate::packages::ToolDependency {
                        packager: d.packager,
                        name: d.name,
                        version: d.version,
                    })
                    .collect();
            }

            for idx_tool in idx_pkg.tools {
                let mut systems = Vec::new();
                for sys in idx_tool.systems {
                    match Checksum::from_str(&sys.checksum) {
                        Ok(checksum) => systems.push(ToolSystem {
                            host: sys.host,
                            resource: DownloadResource {
                                url: sys.url,
                                archive_file_name: sys.archive_file_name,
                                checksum,
                                cache_path: "packages".to_string(),
                                size: sys.size.and_then(|s| s.parse().ok()),
                            },
                        }),
                        Err(e) => {
                            tracing::warn!(
                                tool = %idx_tool.name,
                                host = %sys.host,
                                error = %e,
                                "skipping tool system with bad checksum"
                            );
                        }
                    }
                }
                let tool = package.get_or_create_tool(&idx_tool.name);
                let packager = tool.packager.clone();
                let name = tool.name.clone();
                tool.releases
                    .entry(idx_tool.version.clone())
                    .or_insert_with(|| ToolRelease {
                        packager,
                        name,
                        version: idx_tool.version,
                        systems: Vec::new(),
                    })
                    .systems = systems;
            }
        }
    }

    /// Load installed hardware and bundled tool directories from disk into
    /// the graph: board definitions of installed platform releases, plus
    /// graph entries for releases present on disk but absent from every
    /// index. Best-effort; each failure is returned, none aborts the scan.
    pub fn load_hardware(&mut self) -> Vec<CoriumError> {
        let mut errors = Vec::new();
        let package_names = match list_subdirs(&self.packages_dir) {
            Ok(names) => names,
            Err(_) => return errors, // nothing installed yet
        };

        for pkg_name in package_names {
            let pkg_dir = self.packages_dir.join(&pkg_name);

            let hardware_dir = pkg_dir.join("hardware");
            for arch in list_subdirs(&hardware_dir).unwrap_or_default() {
                for version in list_subdirs(&hardware_dir.join(&arch)).unwrap_or_default() {
                    let release = self
                        .packages
                        .get_or_create_package(&pkg_name)
                        .get_or_create_platform(&arch)
                        .get_or_create_release(&version);
                    let boards_file = hardware_dir.join(&arch).join(&version).join("boards.txt");
                    match fqbn::load_board_definitions(&boards_file) {
                        Ok(boards) => release.boards = boards,
                        Err(e) => errors.push(e),
                    }
                }
            }

            let tools_dir = pkg_dir.join("tools");
            for tool_name in list_subdirs(&tools_dir).unwrap_or_default() {
                for version in list_subdirs(&tools_dir.join(&tool_name)).unwrap_or_default() {
                    let tool = self
                        .packages
                        .get_or_create_package(&pkg_name)
                        .get_or_create_tool(&tool_name);
                    let packager = tool.packager.clone();
                    let name = tool.name.clone();
                    tool.releases
                        .entry(version.clone())
                        .or_insert_with(|| ToolRelease {
                            packager,
                            name,
                            version,
                            systems: Vec::new(),
                        });
                }
            }
        }

        errors
    }

    /// Verify configured board-discovery tooling for every installed
    /// platform release. Failures are collected, never fatal.
    pub fn load_discoveries(&self) -> Vec<CoriumError> {
        let mut errors = Vec::new();
        for platform in self.packages.platforms() {
            for release in platform.releases.values() {
                if !release.is_installed(&self.packages_dir) {
                    continue;
                }
                let platform_txt = release.install_dir(&self.packages_dir).join("platform.txt");
                let props = match fqbn::parse_properties_file(&platform_txt) {
                    Ok(p) => p,
                    Err(_) => continue, // platform.txt is optional
                };
                for (key, value) in &props {
                    if key != "discovery.required" && !key.starts_with("discovery.required.") {
                        continue;
                    }
                    let Some((packager, tool)) = value.split_once(':') else {
                        errors.push(CoriumError::NotFound(format!(
                            "malformed discovery reference '{value}' in {release}"
                        )));
                        continue;
                    };
                    let installed = self
                        .packages
                        .find_package(packager)
                        .and_then(|p| p.tools.get(tool))
                        .map(|t| {
                            t.releases
                                .values()
                                .any(|r| r.is_installed(&self.packages_dir))
                        })
                        .unwrap_or(false);
                    if !installed {
                        errors.push(CoriumError::NotFound(format!(
                            "discovery tool {packager}:{tool} required by {release} is not installed"
                        )));
                    }
                }
            }
        }
        errors
    }

    /// Highest installed release of a platform, derived from disk presence.
    pub fn get_installed_platform_release(
        &self,
        package: &str,
        architecture: &str,
    ) -> Option<PlatformRelease> {
        let platform = self.packages.find_platform(package, architecture)?;
        platform
            .releases
            .values()
            .filter(|r| r.is_installed(&self.packages_dir))
            .max_by(|a, b| compare_versions(&a.version, &b.version))
            .cloned()
    }

    pub fn find_platform_release(&self, reference: &PlatformReference) -> Result<PlatformRelease> {
        self.packages
            .find_platform_release(reference)
            .cloned()
            .ok_or_else(|| CoriumError::NotFound(format!("platform {reference}")))
    }

    /// Resolve the full set of tool releases a platform release requires:
    /// its direct tool dependencies, each carrying the download variant for
    /// the running host.
    pub fn find_platform_release_dependencies(
        &self,
        reference: &PlatformReference,
    ) -> Result<(PlatformRelease, Vec<ToolRelease>)> {
        let release = self.find_platform_release(reference)?;
        let mut tools = Vec::new();
        for dep in &release.tool_dependencies {
            let tool = self
                .packages
                .find_tool_release(&dep.packager, &dep.name, &dep.version)
                .cloned()
                .ok_or_else(|| {
                    CoriumError::NotFound(format!(
                        "tool {}:{}@{} required by {reference}",
                        dep.packager, dep.name, dep.version
                    ))
                })?;
            tools.push(tool);
        }
        Ok((release, tools))
    }

    /// A tool release is required iff at least one *installed* platform
    /// release still lists it as a dependency. Computed against disk state.
    pub fn is_tool_required(&self, tool: &ToolRelease) -> bool {
        self.packages.platforms().any(|platform| {
            platform.releases.values().any(|release| {
                release.is_installed(&self.packages_dir)
                    && release.tool_dependencies.iter().any(|d| {
                        d.packager == tool.packager
                            && d.name == tool.name
                            && d.version == tool.version
                    })
            })
        })
    }

    pub async fn download_platform_release(
        &self,
        release: &PlatformRelease,
        sink: &ProgressSink,
    ) -> Result<()> {
        let resource = release.resource.as_ref().ok_or_else(|| {
            CoriumError::NotFound(format!("no download resource for platform {release}"))
        })?;
        resource
            .download(&self.downloads_dir, &self.client, sink)
            .await?;
        Ok(())
    }

    pub async fn download_tool_release(
        &self,
        tool: &ToolRelease,
        sink: &ProgressSink,
    ) -> Result<()> {
        let system = self.host_system_for(tool)?;
        system
            .resource
            .download(&self.downloads_dir, &self.client, sink)
            .await?;
        Ok(())
    }

    fn host_system_for<'a>(&self, tool: &'a ToolRelease) -> Result<&'a ToolSystem> {
        tool.host_system().ok_or_else(|| {
            CoriumError::NotFound(format!("no download variant of tool {tool} for this host"))
        })
    }

    pub fn install_platform_release(&self, release: &PlatformRelease) -> Result<()> {
        let resource = release.resource.as_ref().ok_or_else(|| {
            CoriumError::NotFound(format!("no download resource for platform {release}"))
        })?;
        let dest = release.install_dir(&self.packages_dir);
        tracing::info!(platform = %release, dest = %dest.display(), "installing platform");
        resource.install(&self.downloads_dir, &self.tmp_dir, &dest)
    }

    pub fn uninstall_platform_release(&self, release: &PlatformRelease) -> Result<()> {
        let dir = release.install_dir(&self.packages_dir);
        if !dir.is_dir() {
            return Err(CoriumError::FailedUninstall {
                what: release.to_string(),
                message: "platform is not installed".to_string(),
            });
        }
        tracing::info!(platform = %release, "uninstalling platform");
        resources::remove_install_dir(&dir)
    }

    pub fn install_tool_release(&self, tool: &ToolRelease) -> Result<()> {
        let system = self.host_system_for(tool)?;
        let dest = tool.install_dir(&self.packages_dir);
        tracing::info!(tool = %tool, dest = %dest.display(), "installing tool");
        system
            .resource
            .install(&self.downloads_dir, &self.tmp_dir, &dest)
    }

    pub fn uninstall_tool_release(&self, tool: &ToolRelease) -> Result<()> {
        let dir = tool.install_dir(&self.packages_dir);
        if !dir.is_dir() {
            return Err(CoriumError::FailedUninstall {
                what: tool.to_string(),
                message: "tool is not installed".to_string(),
            });
        }
        tracing::info!(tool = %tool, "uninstalling tool");
        resources::remove_install_dir(&dir)
    }

    /// Run the platform's post-install hook, if it ships one. The caller
    /// decides whether a failure matters; upgrades treat it as a warning.
    pub fn run_post_install_script(&self, release: &PlatformRelease) -> Result<()> {
        let install_dir = release.install_dir(&self.packages_dir);
        let script = install_dir.join("post_install.sh");
        if !script.is_file() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let status = std::process::Command::new("/bin/sh")
                .arg(&script)
                .current_dir(&install_dir)
                .status()
                .with_context(|| format!("running {}", script.display()))?;
            if !status.success() {
                return Err(CoriumError::FailedInstall {
                    what: release.to_string(),
                    message: format!("post_install.sh exited with {status}"),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageManager")
            .field("data_dir", &self.data_dir)
            .field("packages", &self.packages.0.len())
            .finish()
    }
}

fn list_subdirs(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}
