//! Download, integrity and installation of remote artifacts.
//!
//! A [`DownloadResource`] is the shared shape behind platform archives, tool
//! archives and library archives: a URL, an expected archive file name, a
//! SHA-256 checksum and a cache sub-path under the downloads directory.
//!
//! Downloads are idempotent: an artifact already in the cache that passes
//! its integrity check is never transferred again, and a corrupt cached
//! artifact is deleted and re-fetched rather than served as-is. Transfers
//! stream to a `.part` file and resume from its length, so an interrupted
//! download picks up where it left off.
//!
//! Installation unpacks into a unique temp directory, requires the archive
//! to contain exactly one root directory, and renames that root onto the
//! destination. The rename is the atomicity boundary: a concurrent reader
//! of the destination path sees the old tree, the new tree, or nothing,
//! never a partial mix. Temp root and destination must live on the same
//! filesystem for the rename to work.

use crate::error::{CoriumError, Result};
use crate::events::ProgressSink;
use crate::index::Checksum;
use anyhow::Context;
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;
use tokio::io::AsyncWriteExt;

/// A fetchable, verifiable artifact.
#[derive(Debug, Clone)]
pub struct DownloadResource {
    pub url: String,
    pub archive_file_name: String,
    pub checksum: Checksum,
    /// Sub-path of the downloads directory this artifact is cached under
    /// (e.g. `packages`, `libraries`).
    pub cache_path: String,
    pub size: Option<u64>,
}

/// What a call to [`DownloadResource::download`] actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The cached artifact passed verification; no transfer happened.
    AlreadyCached,
    Downloaded,
}

impl DownloadResource {
    /// Deterministic cache location: `{downloads}/{cache_path}/{file name}`.
    /// Creates the staging directory if missing.
    pub fn archive_path(&self, downloads_dir: &Path) -> Result<PathBuf> {
        let staging = downloads_dir.join(&self.cache_path);
        fs::create_dir_all(&staging).context("creating staging directory")?;
        Ok(staging.join(&self.archive_file_name))
    }

    /// True if the artifact is present in the cache and matches its checksum.
    pub fn test_local_archive_integrity(&self, downloads_dir: &Path) -> Result<bool> {
        let path = self.archive_path(downloads_dir)?;
        if !path.exists() {
            return Ok(false);
        }
        self.checksum.matches_file(&path)
    }

    /// Fetch the artifact into the downloads cache.
    ///
    /// A no-op when the cached copy verifies; a corrupt cached copy is
    /// deleted and re-fetched. `file://` URLs are copied straight from the
    /// filesystem; everything else goes through HTTP with Range resume.
    pub async fn download(
        &self,
        downloads_dir: &Path,
        client: &reqwest::Client,
        sink: &ProgressSink,
    ) -> Result<DownloadOutcome> {
        let path = self.archive_path(downloads_dir)?;

        if path.exists() {
            if self.checksum.matches_file(&path)? {
                tracing::debug!(file = %path.display(), "archive already cached");
                return Ok(DownloadOutcome::AlreadyCached);
            }
            tracing::warn!(file = %path.display(), "removing corrupted cached archive");
            fs::remove_file(&path)?;
        }

        let part = path.with_file_name(format!("{}.part", self.archive_file_name));

        if let Some(local) = self.url.strip_prefix("file://") {
            tokio::fs::copy(local, &part)
                .await
                .map_err(|e| CoriumError::FailedDownload {
                    url: self.url.clone(),
                    message: e.to_string(),
                })?;
            let len = fs::metadata(&part)?.len();
            sink.download(&self.archive_file_name, len, len, true);
        } else {
            self.fetch_http(client, &part, sink).await?;
        }

        fs::rename(&part, &path)?;

        if !self.checksum.matches_file(&path)? {
            fs::remove_file(&path)?;
            return Err(CoriumError::ChecksumMismatch { file: path });
        }

        Ok(DownloadOutcome::Downloaded)
    }

    async fn fetch_http(
        &self,
        client: &reqwest::Client,
        part: &Path,
        sink: &ProgressSink,
    ) -> Result<()> {
        let failed = |message: String| CoriumError::FailedDownload {
            url: self.url.clone(),
            message,
        };

        let mut resume_from = match fs::metadata(part) {
            Ok(m) => m.len(),
            Err(_) => 0,
        };

        let mut request = client.get(&self.url);
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
        }

        let mut response = request.send().await.map_err(|e| failed(e.to_string()))?;

        // Server ignored the range request: start over.
        if resume_from > 0 && response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            resume_from = 0;
        }
        if !response.status().is_success() {
            return Err(failed(format!("HTTP status {}", response.status())));
        }

        let total_size = resume_from + response.content_length().unwrap_or(0);
        sink.download(&self.archive_file_name, total_size, resume_from, false);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(resume_from > 0)
            .write(true)
            .truncate(resume_from == 0)
            .open(part)
            .await?;

        let mut downloaded = resume_from;
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            sink.download(&self.archive_file_name, total_size, downloaded, false);
        }
        file.flush().await?;

        sink.download(&self.archive_file_name, total_size, downloaded, true);
        Ok(())
    }

    /// Atomically unpack the verified archive onto `dest_dir`.
    ///
    /// Integrity is re-checked here even though `download` already verified
    /// it; the two calls may be far apart in time.
    pub fn install(&self, downloads_dir: &Path, tmp_root: &Path, dest_dir: &Path) -> Result<()> {
        let archive_path = self.archive_path(downloads_dir)?;

        if !self.test_local_archive_integrity(downloads_dir)? {
            return Err(CoriumError::ChecksumMismatch { file: archive_path });
        }

        fs::create_dir_all(tmp_root).context("creating temp root for extraction")?;
        let tmp = tempfile::Builder::new()
            .prefix("package-")
            .tempdir_in(tmp_root)
            .context("creating temp dir for extraction")?;

        let file = fs::File::open(&archive_path)
            .with_context(|| format!("opening archive {}", archive_path.display()))?;
        let mut archive = Archive::new(GzDecoder::new(file));
        archive
            .unpack(tmp.path())
            .with_context(|| format!("extracting {}", archive_path.display()))?;

        let root = find_archive_root(tmp.path()).map_err(|message| CoriumError::ArchiveLayout {
            archive: archive_path.clone(),
            message,
        })?;

        if let Some(parent) = dest_dir.parent() {
            fs::create_dir_all(parent).context("creating destination parent")?;
        }
        if dest_dir.is_dir() {
            fs::remove_dir_all(dest_dir).context("removing previous destination")?;
        }

        // Atomicity boundary: a partial extraction is never visible at the
        // destination path.
        fs::rename(&root, dest_dir).map_err(|e| {
            // back out the destination parent if it was created for nothing
            prune_empty_parent(dest_dir);
            CoriumError::FailedInstall {
                what: dest_dir.display().to_string(),
                message: format!("moving extracted archive to destination: {e}"),
            }
        })?;

        // tmp cleans itself up on drop
        Ok(())
    }
}

/// Fetch a small document (an index or its signature) straight to `dest`.
/// No resume, no caching; these are tiny compared to archives.
pub(crate) async fn fetch_to_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let failed = |message: String| CoriumError::FailedDownload {
        url: url.to_string(),
        message,
    };
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP status {}", response.status())));
    }
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    fs::write(dest, &bytes)?;
    Ok(())
}

/// Locate the single root directory of an extracted archive.
fn find_archive_root(parent: &Path) -> std::result::Result<PathBuf, String> {
    let mut root: Option<PathBuf> = None;
    let entries = fs::read_dir(parent).map_err(|e| format!("reading extracted content: {e}"))?;
    for entry in entries {
        let entry = entry.map_err(|e| format!("reading extracted content: {e}"))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(found) = &root {
            return Err(format!(
                "no unique root dir in archive, found '{}' and '{}'",
                found.display(),
                entry.path().display()
            ));
        }
        root = Some(entry.path());
    }
    root.ok_or_else(|| "files in archive must be placed in a single root directory".to_string())
}

/// Remove an installed release directory, pruning its parent when that
/// leaves the parent empty (e.g. the last version of a tool).
pub fn remove_install_dir(dir: &Path) -> Result<()> {
    fs::remove_dir_all(dir).map_err(|e| CoriumError::FailedUninstall {
        what: dir.display().to_string(),
        message: e.to_string(),
    })?;
    prune_empty_parent(dir);
    Ok(())
}

/// Remove `dir`'s parent when it is empty.
fn prune_empty_parent(dir: &Path) {
    if let Some(parent) = dir.parent() {
        let empty = parent
            .read_dir()
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if empty {
            let _ = fs::remove_dir(parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    /// Build a tar.gz at `archive` containing the given empty directories
    /// and (path, contents) files.
    fn make_archive(archive: &Path, dirs: &[&str], files: &[(&str, &[u8])]) {
        let file = fs::File::create(archive).unwrap();
        let enc = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(enc);
        for d in dirs {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, format!("{d}/"), std::io::empty()).unwrap();
        }
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn resource_for(archive: &Path, cache_path: &str) -> DownloadResource {
        let data = fs::read(archive).unwrap();
        DownloadResource {
            url: format!("file://{}", archive.display()),
            archive_file_name: archive.file_name().unwrap().to_string_lossy().into_owned(),
            checksum: Checksum::of_bytes(&data),
            cache_path: cache_path.to_string(),
            size: Some(data.len() as u64),
        }
    }

    #[test]
    fn test_install_single_root() {
        let env = tempfile::tempdir().unwrap();
        let archive = env.path().join("pkg.tar.gz");
        make_archive(
            &archive,
            &["pkg-1.0.0"],
            &[("pkg-1.0.0/platform.txt", b"name=Pkg\n")],
        );

        let downloads = env.path().join("staging");
        let resource = resource_for(&archive, "packages");
        // seed the cache directly
        let cached = resource.archive_path(&downloads).unwrap();
        fs::copy(&archive, &cached).unwrap();

        let dest = env.path().join("data/packages/pkg/hardware/arch/1.0.0");
        resource
            .install(&downloads, &env.path().join("tmp"), &dest)
            .unwrap();

        assert!(dest.join("platform.txt").exists());
    }

    #[test]
    fn test_install_replaces_existing_destination() {
        let env = tempfile::tempdir().unwrap();
        let archive = env.path().join("pkg.tar.gz");
        make_archive(&archive, &["pkg-2.0.0"], &[("pkg-2.0.0/new.txt", b"new")]);

        let downloads = env.path().join("staging");
        let resource = resource_for(&archive, "packages");
        fs::copy(&archive, resource.archive_path(&downloads).unwrap()).unwrap();

        let dest = env.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("old.txt"), b"old").unwrap();

        resource
            .install(&downloads, &env.path().join("tmp"), &dest)
            .unwrap();

        assert!(dest.join("new.txt").exists());
        assert!(!dest.join("old.txt").exists());
    }

    #[test]
    fn test_install_rejects_two_roots_and_leaves_destination_untouched() {
        let env = tempfile::tempdir().unwrap();
        let archive = env.path().join("two.tar.gz");
        make_archive(&archive, &["a", "b"], &[]);

        let downloads = env.path().join("staging");
        let resource = resource_for(&archive, "packages");
        fs::copy(&archive, resource.archive_path(&downloads).unwrap()).unwrap();

        let dest = env.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("keep.txt"), b"keep").unwrap();

        let err = resource
            .install(&downloads, &env.path().join("tmp"), &dest)
            .unwrap_err();
        assert!(matches!(err, CoriumError::ArchiveLayout { .. }));
        assert!(dest.join("keep.txt").exists());
    }

    #[test]
    fn test_install_rejects_zero_roots() {
        let env = tempfile::tempdir().unwrap();
        let archive = env.path().join("flat.tar.gz");
        make_archive(&archive, &[], &[("loose.txt", b"loose")]);

        let downloads = env.path().join("staging");
        let resource = resource_for(&archive, "packages");
        fs::copy(&archive, resource.archive_path(&downloads).unwrap()).unwrap();

        let dest = env.path().join("dest");
        let err = resource
            .install(&downloads, &env.path().join("tmp"), &dest)
            .unwrap_err();
        assert!(matches!(err, CoriumError::ArchiveLayout { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_install_corrupt_cache_fails_integrity() {
        let env = tempfile::tempdir().unwrap();
        let archive = env.path().join("pkg.tar.gz");
        make_archive(&archive, &["root"], &[]);

        let downloads = env.path().join("staging");
        let resource = resource_for(&archive, "packages");
        let cached = resource.archive_path(&downloads).unwrap();
        fs::write(&cached, b"corrupted bytes").unwrap();

        let err = resource
            .install(&downloads, &env.path().join("tmp"), &env.path().join("dest"))
            .unwrap_err();
        assert!(matches!(err, CoriumError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_failed_rename_backs_out_created_parent() {
        let env = tempfile::tempdir().unwrap();
        let archive = env.path().join("pkg.tar.gz");
        make_archive(&archive, &["pkg-1.0.0"], &[]);

        let downloads = env.path().join("staging");
        let resource = resource_for(&archive, "packages");
        fs::copy(&archive, resource.archive_path(&downloads).unwrap()).unwrap();

        // a final path component past NAME_MAX makes the rename fail after
        // the parent directory has already been created
        let parent = env.path().join("data/packages/pkg/hardware/arch");
        let dest = parent.join("v".repeat(300));
        let err = resource
            .install(&downloads, &env.path().join("tmp"), &dest)
            .unwrap_err();

        assert!(matches!(err, CoriumError::FailedInstall { .. }));
        assert!(!parent.exists());
    }

    #[test]
    fn test_remove_install_dir_prunes_empty_parent() {
        let env = tempfile::tempdir().unwrap();
        let parent = env.path().join("tools/toolx");
        let version = parent.join("1.0.0");
        fs::create_dir_all(&version).unwrap();

        remove_install_dir(&version).unwrap();
        assert!(!parent.exists());

        // parent with a sibling survives
        let v1 = env.path().join("tools/tooly/1.0.0");
        let v2 = env.path().join("tools/tooly/2.0.0");
        fs::create_dir_all(&v1).unwrap();
        fs::create_dir_all(&v2).unwrap();
        remove_install_dir(&v1).unwrap();
        assert!(v2.exists());
    }
}
