//! Library index, installed-library scanning and library installs.
//!
//! Libraries live in flat directories: every first-level subdirectory of a
//! registered libraries dir is one library, described by its
//! `library.properties` file. Only the user location is writable; platform
//! bundled and IDE bundled locations are scanned read-only.

use crate::error::{CoriumError, Result};
use crate::events::ProgressSink;
use crate::index::Checksum;
use crate::packages::compare_versions;
use crate::resources::{self, DownloadResource};
use crate::security::{self, IndexSecurity};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Where an installed library was found. Precedence when the same name
/// appears in several locations follows registration order: dirs registered
/// earlier win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryLocation {
    /// The user's own libraries dir, the only writable location.
    User,
    /// Bundled inside an installed platform release.
    PlatformBuiltIn,
    /// Shipped with the IDE.
    IdeBuiltIn,
}

/// An installed library discovered on disk.
#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    pub version: String,
    pub author: Option<String>,
    pub sentence: Option<String>,
    pub location: LibraryLocation,
    pub install_dir: PathBuf,
}

/// Root of a library index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryIndex {
    #[serde(default)]
    pub libraries: Vec<IndexLibraryRelease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexLibraryRelease {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub sentence: Option<String>,
    pub url: String,
    pub archive_file_name: String,
    pub checksum: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl IndexLibraryRelease {
    fn resource(&self) -> Result<DownloadResource> {
        Ok(DownloadResource {
            url: self.url.clone(),
            archive_file_name: self.archive_file_name.clone(),
            checksum: Checksum::from_str(&self.checksum)?,
            cache_path: "libraries".to_string(),
            size: self.size,
        })
    }
}

impl LibraryIndex {
    pub fn parse(data: &[u8], source: &str) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| CoriumError::InvalidIndex {
            path: source.to_string(),
            source: e,
        })
    }

    /// Latest release of a library by version order.
    pub fn latest(&self, name: &str) -> Option<&IndexLibraryRelease> {
        self.libraries
            .iter()
            .filter(|l| l.name == name)
            .max_by(|a, b| compare_versions(&a.version, &b.version))
    }
}

/// What a library install actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryInstallOutcome {
    AlreadyInstalled,
    Installed,
}

pub struct LibrariesManager {
    index_file: PathBuf,
    downloads_dir: PathBuf,
    tmp_dir: PathBuf,
    /// Registered in precedence order, highest first.
    libraries_dirs: Vec<(PathBuf, LibraryLocation)>,
    pub index: LibraryIndex,
    /// Installed libraries by name, rebuilt by [`Self::rescan_libraries`].
    pub libraries: BTreeMap<String, Library>,
}

impl LibrariesManager {
    pub fn new(data_dir: &Path, downloads_dir: PathBuf, tmp_dir: PathBuf) -> Self {
        Self {
            index_file: data_dir.join("library_index.json"),
            downloads_dir,
            tmp_dir,
            libraries_dirs: Vec::new(),
            index: LibraryIndex::default(),
            libraries: BTreeMap::new(),
        }
    }

    /// Register a libraries dir. Duplicates are ignored; the location of
    /// the first registration sticks.
    pub fn add_libraries_dir(&mut self, dir: PathBuf, location: LibraryLocation) {
        if !self.libraries_dirs.iter().any(|(d, _)| *d == dir) {
            self.libraries_dirs.push((dir, location));
        }
    }

    /// Load the cached library index. A missing file leaves the index
    /// empty; a malformed one is an error.
    pub fn load_index(&mut self) -> Result<()> {
        if !self.index_file.exists() {
            self.index = LibraryIndex::default();
            return Ok(());
        }
        let data = fs::read(&self.index_file)?;
        self.index = LibraryIndex::parse(&data, &self.index_file.display().to_string())?;
        Ok(())
    }

    /// Refresh the cached library index from `url`, honoring the signature
    /// policy the same way platform indexes do.
    pub async fn update_index(
        &self,
        client: &reqwest::Client,
        url: &str,
        sec: &IndexSecurity,
        sink: &ProgressSink,
    ) -> Result<()> {
        if let Some(local) = url.strip_prefix("file://") {
            LibraryIndex::parse(&fs::read(local)?, url)?;
            if let Some(parent) = self.index_file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(local, &self.index_file)?;
            return Ok(());
        }

        let staging = tempfile::tempdir().context("creating index staging dir")?;
        let tmp_index = staging.path().join("library_index.json");

        sink.task_started(format!("Updating index: {url}"));
        resources::fetch_to_file(client, url, &tmp_index).await?;

        if sec.policy.requires_signature(url, &sec.trusted_host) {
            let tmp_sig = staging.path().join("library_index.json.sig");
            resources::fetch_to_file(client, &format!("{url}.sig"), &tmp_sig).await?;
            security::verify_signature_file(&tmp_index, &tmp_sig, &sec.verifying_key)?;

            let dest_sig = self.index_file.with_extension("json.sig");
            fs::copy(&tmp_sig, &dest_sig)?;
        }

        LibraryIndex::parse(&fs::read(&tmp_index)?, url)?;

        if let Some(parent) = self.index_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&tmp_index, &self.index_file)?;
        sink.task_completed(format!("Updated index: {url}"));
        Ok(())
    }

    /// Rebuild the installed-library map from the registered dirs.
    /// Best-effort; unreadable metadata is reported, not fatal.
    pub fn rescan_libraries(&mut self) -> Vec<CoriumError> {
        let mut errors = Vec::new();
        self.libraries.clear();

        for (dir, location) in &self.libraries_dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
            {
                match load_library(entry.path(), *location) {
                    Ok(library) => {
                        // earlier-registered dirs take precedence
                        self.libraries
                            .entry(library.name.clone())
                            .or_insert(library);
                    }
                    Err(e) => errors.push(e),
                }
            }
        }

        errors
    }

    /// Index release newer than the installed user-location library, if any.
    pub fn find_update(&self, name: &str) -> Option<&IndexLibraryRelease> {
        let installed = self.libraries.get(name)?;
        if installed.location != LibraryLocation::User {
            return None;
        }
        let latest = self.index.latest(name)?;
        if compare_versions(&latest.version, &installed.version) == Ordering::Greater {
            Some(latest)
        } else {
            None
        }
    }

    fn user_libraries_dir(&self) -> Result<&Path> {
        self.libraries_dirs
            .iter()
            .find(|(_, loc)| *loc == LibraryLocation::User)
            .map(|(d, _)| d.as_path())
            .ok_or(CoriumError::MissingConfiguration)
    }

    /// Download and install a library release into the user dir, replacing
    /// any previous version of the same library.
    pub async fn install(
        &self,
        release: &IndexLibraryRelease,
        client: &reqwest::Client,
        sink: &ProgressSink,
    ) -> Result<LibraryInstallOutcome> {
        let user_dir = self.user_libraries_dir()?;
        let dest = user_dir.join(release.name.replace(' ', "_"));

        if let Some(installed) = self.libraries.get(&release.name) {
            if installed.location == LibraryLocation::User && installed.version == release.version {
                return Ok(LibraryInstallOutcome::AlreadyInstalled);
            }
        }

        let resource = release.resource()?;
        resource.download(&self.downloads_dir, client, sink).await?;
        resource.install(&self.downloads_dir, &self.tmp_dir, &dest)?;
        Ok(LibraryInstallOutcome::Installed)
    }

    /// Remove an installed user-location library.
    pub fn uninstall(&mut self, name: &str) -> Result<()> {
        let library = self
            .libraries
            .get(name)
            .ok_or_else(|| CoriumError::NotFound(format!("library {name}")))?;
        if library.location != LibraryLocation::User {
            return Err(CoriumError::FailedUninstall {
                what: name.to_string(),
                message: "only user-installed libraries can be removed".to_string(),
            });
        }
        fs::remove_dir_all(&library.install_dir).map_err(|e| CoriumError::FailedUninstall {
            what: name.to_string(),
            message: e.to_string(),
        })?;
        self.libraries.remove(name);
        Ok(())
    }
}

impl std::fmt::Debug for LibrariesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibrariesManager")
            .field("index_file", &self.index_file)
            .field("libraries", &self.libraries.len())
            .finish()
    }
}

/// Read one library directory. Directories without `library.properties`
/// still count as legacy libraries named after the directory.
fn load_library(dir: &Path, location: LibraryLocation) -> Result<Library> {
    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let props_file = dir.join("library.properties");
    if !props_file.is_file() {
        return Ok(Library {
            name: dir_name,
            version: String::new(),
            author: None,
            sentence: None,
            location,
            install_dir: dir.to_path_buf(),
        });
    }

    let props = crate::fqbn::parse_properties_file(&props_file)?;
    Ok(Library {
        name: props.get("name").cloned().unwrap_or(dir_name),
        version: props.get("version").cloned().unwrap_or_default(),
        author: props.get("author").cloned(),
        sentence: props.get("sentence").cloned(),
        location,
        install_dir: dir.to_path_buf(),
    })
}
