//! Fully qualified board names and build property resolution.
//!
//! An FQBN names a board inside an installed platform release:
//! `package:architecture:board_id` with optional `:key=value,...` config
//! options appended. Resolving one produces the flattened build property
//! set for that board, with menu-option overlays applied on top.

use crate::error::{CoriumError, Result};
use crate::package_manager::PackageManager;
use crate::packages::{Board, PlatformReference};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fqbn {
    pub package: String,
    pub architecture: String,
    pub board_id: String,
    /// Menu option selections, e.g. `cpu=atmega328`. Order preserved from
    /// the input string since later options may override earlier overlays.
    pub config_options: Vec<(String, String)>,
}

impl FromStr for Fqbn {
    type Err = CoriumError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoriumError::InvalidFqbn(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(invalid());
        }
        let (package, architecture, board_id) = (parts[0], parts[1], parts[2]);
        if package.is_empty() || architecture.is_empty() || board_id.is_empty() {
            return Err(invalid());
        }

        let mut config_options = Vec::new();
        if parts.len() == 4 {
            for pair in parts[3].split(',') {
                let (key, value) = pair.split_once('=').ok_or_else(invalid)?;
                if key.is_empty() || value.is_empty() {
                    return Err(invalid());
                }
                config_options.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            package: package.to_string(),
            architecture: architecture.to_string(),
            board_id: board_id.to_string(),
            config_options,
        })
    }
}

impl fmt::Display for Fqbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.package, self.architecture, self.board_id
        )?;
        for (i, (k, v)) in self.config_options.iter().enumerate() {
            write!(f, "{}{k}={v}", if i == 0 { ':' } else { ',' })?;
        }
        Ok(())
    }
}

/// A board resolved against an installed platform release.
#[derive(Debug, Clone)]
pub struct ResolvedBoard {
    pub fqbn: Fqbn,
    pub board_name: String,
    pub platform_release: PlatformReference,
    pub build_properties: BTreeMap<String, String>,
}

/// Parse a `key=value` properties file. Blank lines and `#` comments are
/// skipped; later duplicates win.
pub fn parse_properties_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)?;
    let mut props = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(props)
}

/// Load the board definition file of an installed platform release and
/// group its properties by board id. Top-level `menu.*` keys name the menus
/// themselves and belong to no board.
pub fn load_board_definitions(path: &Path) -> Result<BTreeMap<String, Board>> {
    let props = parse_properties_file(path)?;
    let mut boards: BTreeMap<String, Board> = BTreeMap::new();
    for (key, value) in props {
        let Some((board_id, rest)) = key.split_once('.') else {
            continue;
        };
        if board_id == "menu" {
            continue;
        }
        let board = boards
            .entry(board_id.to_string())
            .or_insert_with(|| Board {
                board_id: board_id.to_string(),
                ..Default::default()
            });
        if rest == "name" {
            board.name = value;
        } else {
            board.properties.insert(rest.to_string(), value);
        }
    }
    Ok(boards)
}

impl PackageManager {
    /// Resolve an FQBN to the build properties of its board.
    ///
    /// Resolution order: the installed release's `platform.txt`, then the
    /// board's own properties, then one overlay per config option. A
    /// `build.core` value of the form `referenced_package:core` swaps the
    /// base `platform.txt` for the referenced package's installed platform
    /// of the same architecture.
    pub fn resolve_fqbn(&self, fqbn: &Fqbn) -> Result<ResolvedBoard> {
        let package = self
            .packages
            .find_package(&fqbn.package)
            .ok_or_else(|| CoriumError::UnknownPackage(fqbn.package.clone()))?;
        package.platforms.get(&fqbn.architecture).ok_or_else(|| {
            CoriumError::UnknownPlatform(fqbn.package.clone(), fqbn.architecture.clone())
        })?;
        let release = self
            .get_installed_platform_release(&fqbn.package, &fqbn.architecture)
            .ok_or_else(|| {
                CoriumError::PlatformNotInstalled(fqbn.package.clone(), fqbn.architecture.clone())
            })?;
        let board = release
            .boards
            .get(&fqbn.board_id)
            .ok_or_else(|| CoriumError::UnknownBoard(fqbn.to_string()))?;

        let mut properties = self.platform_txt_properties(&release)?;
        for (key, value) in &board.properties {
            properties.insert(key.clone(), value.clone());
        }

        for (option, selection) in &fqbn.config_options {
            let prefix = format!("menu.{option}.{selection}");
            if !board.properties.contains_key(&prefix)
                && !board
                    .properties
                    .keys()
                    .any(|k| k.starts_with(&format!("{prefix}.")))
            {
                return Err(CoriumError::InvalidConfigOption(format!(
                    "{option}={selection} for board {fqbn}"
                )));
            }
            for (key, value) in &board.properties {
                if let Some(sub) = key.strip_prefix(&format!("{prefix}.")) {
                    properties.insert(sub.to_string(), value.clone());
                }
            }
        }

        // A core reference delegates the base platform.txt to another
        // vendor's installed platform of the same architecture.
        if let Some(core) = properties.get("build.core").cloned() {
            if let Some((ref_package, core_name)) = core.split_once(':') {
                let referenced = self
                    .get_installed_platform_release(ref_package, &fqbn.architecture)
                    .ok_or_else(|| {
                        CoriumError::PlatformNotInstalled(
                            ref_package.to_string(),
                            fqbn.architecture.clone(),
                        )
                    })?;
                let base = self.platform_txt_properties(&referenced)?;
                for (key, value) in base {
                    properties.entry(key).or_insert(value);
                }
                properties.insert("build.core".to_string(), core_name.to_string());
            }
        }

        properties.insert("build.fqbn".to_string(), fqbn.to_string());
        properties.insert(
            "build.arch".to_string(),
            fqbn.architecture.to_ascii_uppercase(),
        );

        Ok(ResolvedBoard {
            fqbn: fqbn.clone(),
            board_name: board.name.clone(),
            platform_release: release.reference(),
            build_properties: properties,
        })
    }

    fn platform_txt_properties(
        &self,
        release: &crate::packages::PlatformRelease,
    ) -> Result<BTreeMap<String, String>> {
        let path = release.install_dir(self.packages_dir()).join("platform.txt");
        if path.is_file() {
            parse_properties_file(&path)
        } else {
            Ok(BTreeMap::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fqbn() {
        let fqbn: Fqbn = "vendora:arch1:boardz".parse().unwrap();
        assert_eq!(fqbn.package, "vendora");
        assert_eq!(fqbn.architecture, "arch1");
        assert_eq!(fqbn.board_id, "boardz");
        assert!(fqbn.config_options.is_empty());

        let fqbn: Fqbn = "vendora:arch1:boardz:cpu=fast,mem=big".parse().unwrap();
        assert_eq!(
            fqbn.config_options,
            vec![
                ("cpu".to_string(), "fast".to_string()),
                ("mem".to_string(), "big".to_string())
            ]
        );
        assert_eq!(fqbn.to_string(), "vendora:arch1:boardz:cpu=fast,mem=big");
    }

    #[test]
    fn test_parse_fqbn_rejects_malformed() {
        for bad in [
            "",
            "vendora",
            "vendora:arch1",
            "vendora:arch1:boardz:extra:parts",
            "vendora::boardz",
            "vendora:arch1:boardz:cpu",
            "vendora:arch1:boardz:cpu=",
        ] {
            assert!(bad.parse::<Fqbn>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_properties_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.txt");
        std::fs::write(
            &path,
            "# comment\nname=Test Platform\n\nbuild.mcu = m0 \nbuild.mcu=m4\n",
        )
        .unwrap();

        let props = parse_properties_file(&path).unwrap();
        assert_eq!(props["name"], "Test Platform");
        // later duplicate wins, whitespace trimmed
        assert_eq!(props["build.mcu"], "m4");
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_board_definitions_grouping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boards.txt");
        std::fs::write(
            &path,
            concat!(
                "menu.cpu=Processor\n",
                "boardz.name=Board Z\n",
                "boardz.build.mcu=m0\n",
                "boardz.menu.cpu.fast=Fast\n",
                "boardz.menu.cpu.fast.build.f_cpu=48000000\n",
                "boardy.name=Board Y\n",
            ),
        )
        .unwrap();

        let boards = load_board_definitions(&path).unwrap();
        assert_eq!(boards.len(), 2);
        assert_eq!(boards["boardz"].name, "Board Z");
        assert_eq!(boards["boardz"].properties["build.mcu"], "m0");
        assert_eq!(
            boards["boardz"].properties["menu.cpu.fast.build.f_cpu"],
            "48000000"
        );
        assert!(boards["boardy"].properties.is_empty());
    }
}
