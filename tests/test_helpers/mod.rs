// Test helpers for isolated testing
// Provides temp-dir environments and local archive/index fixtures so the
// full pipeline runs without any network access.
#![allow(dead_code)] // each test target uses a different subset

use corium::Settings;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated environment: a data dir, a user dir and a fixtures dir holding
/// archives and index files served over `file://` URLs. Cleaned up on drop.
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub data_dir: PathBuf,
    pub user_dir: PathBuf,
    pub fixtures_dir: PathBuf,
}

/// Route `tracing` output through the test harness. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl TestEnvironment {
    pub fn new() -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let data_dir = temp_dir.path().join("data");
        let user_dir = temp_dir.path().join("user");
        let fixtures_dir = temp_dir.path().join("fixtures");
        fs::create_dir_all(&data_dir).unwrap();
        fs::create_dir_all(user_dir.join("libraries")).unwrap();
        fs::create_dir_all(&fixtures_dir).unwrap();

        Self {
            temp_dir,
            data_dir,
            user_dir,
            fixtures_dir,
        }
    }

    /// Settings pointing every directory into the environment. The package
    /// index URL points at the fixtures dir; write one with
    /// [`Self::write_package_index`] before initializing.
    pub fn settings(&self) -> Settings {
        let mut s = Settings::default();
        s.set("directories.data", self.data_dir.display().to_string());
        s.set("directories.user", self.user_dir.display().to_string());
        s.set(
            "board_manager.default_url",
            self.package_index_url(),
        );
        s.set("library_manager.index_url", self.library_index_url());
        s
    }

    pub fn package_index_url(&self) -> String {
        format!(
            "file://{}",
            self.fixtures_dir.join("package_test_index.json").display()
        )
    }

    pub fn library_index_url(&self) -> String {
        format!(
            "file://{}",
            self.fixtures_dir.join("library_test_index.json").display()
        )
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    /// Build a tar.gz fixture under a single root directory. Returns the
    /// `file://` URL and the `SHA-256:...` checksum of the archive.
    pub fn make_archive(
        &self,
        file_name: &str,
        root: &str,
        files: &[(&str, &str)],
    ) -> (String, String) {
        let path = self.fixtures_dir.join(file_name);
        let file = fs::File::create(&path).unwrap();
        let enc = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(enc);

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_cksum();
        builder
            .append_data(&mut dir_header, format!("{root}/"), std::io::empty())
            .unwrap();

        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{root}/{name}"), contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        (
            format!("file://{}", path.display()),
            checksum_of_file(&path),
        )
    }

    pub fn write_package_index(&self, index: serde_json::Value) {
        fs::write(
            self.fixtures_dir.join("package_test_index.json"),
            serde_json::to_vec_pretty(&index).unwrap(),
        )
        .unwrap();
    }

    pub fn write_library_index(&self, index: serde_json::Value) {
        fs::write(
            self.fixtures_dir.join("library_test_index.json"),
            serde_json::to_vec_pretty(&index).unwrap(),
        )
        .unwrap();
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

pub fn checksum_of_file(path: &Path) -> String {
    let data = fs::read(path).unwrap();
    format!("SHA-256:{}", hex::encode(Sha256::digest(&data)))
}

/// A platform release entry for a fixture index: one board `boardz` with a
/// `cpu` menu and a dependency on `toolx` at the given version.
pub fn platform_entry(
    version: &str,
    archive_url: &str,
    checksum: &str,
    tool_version: &str,
) -> serde_json::Value {
    serde_json::json!({
        "name": "Vendor A Boards",
        "architecture": "arch1",
        "version": version,
        "category": "Contributed",
        "url": archive_url,
        "archiveFileName": archive_url.rsplit('/').next().unwrap(),
        "checksum": checksum,
        "boards": [{"name": "Board Z"}],
        "toolsDependencies": [
            {"packager": "vendora", "name": "toolx", "version": tool_version}
        ]
    })
}

/// A tool release entry with a single `all` host variant, so fixtures work
/// on any build target.
pub fn tool_entry(name: &str, version: &str, archive_url: &str, checksum: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "version": version,
        "systems": [{
            "host": "all",
            "url": archive_url,
            "archiveFileName": archive_url.rsplit('/').next().unwrap(),
            "checksum": checksum
        }]
    })
}

/// Contents of the standard platform fixture: one board with a menu option
/// overlay, identifiable over USB.
pub fn platform_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "boards.txt",
            concat!(
                "menu.cpu=Processor\n",
                "boardz.name=Board Z\n",
                "boardz.vid=0x2341\n",
                "boardz.pid=0x0043\n",
                "boardz.build.mcu=m0\n",
                "boardz.menu.cpu.fast=Fast\n",
                "boardz.menu.cpu.fast.build.f_cpu=48000000\n",
            ),
        ),
        ("platform.txt", "name=Vendor A Boards\nbuild.core=corium\n"),
    ]
}
