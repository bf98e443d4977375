//! High-level operations composed from the managers: index refresh,
//! platform install/uninstall, outdated queries and the full upgrade
//! transaction.
//!
//! Upgrade ordering: every artifact a platform needs is downloaded before
//! anything is installed, so a network failure can never strand a
//! half-upgraded platform. Tools install before the platform that needs
//! them; the superseded platform release is removed only after its
//! replacement is on disk, with a rollback path if that removal fails.

use crate::error::{CoriumError, Result};
use crate::events::ProgressSink;
use crate::instances::{InstanceRegistry, InstanceState};
use crate::library::LibraryInstallOutcome;
use crate::packages::{PlatformReference, PlatformRelease, ToolRelease, compare_versions};
use std::cmp::Ordering;

/// How one platform fared inside an upgrade transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeStatus {
    Upgraded,
    /// The upgrade failed and the previous release is still installed.
    Failed(String),
    /// The upgrade failed and the follow-up removal of the new release
    /// failed too; both versions are on disk and need manual repair.
    RollbackFailed(String),
}

#[derive(Debug, Clone)]
pub struct PlatformUpgrade {
    pub package: String,
    pub architecture: String,
    pub from_version: String,
    pub to_version: String,
    pub status: UpgradeStatus,
}

#[derive(Debug, Clone)]
pub struct LibraryUpgrade {
    pub name: String,
    pub from_version: String,
    pub to_version: String,
    pub status: UpgradeStatus,
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeReport {
    pub libraries: Vec<LibraryUpgrade>,
    pub platforms: Vec<PlatformUpgrade>,
}

#[derive(Debug, Clone)]
pub struct PlatformUpgradeCandidate {
    pub package: String,
    pub architecture: String,
    pub installed_version: String,
    pub latest_version: String,
}

#[derive(Debug, Clone)]
pub struct LibraryUpgradeCandidate {
    pub name: String,
    pub installed_version: String,
    pub available_version: String,
}

#[derive(Debug, Clone, Default)]
pub struct OutdatedReport {
    pub platforms: Vec<PlatformUpgradeCandidate>,
    pub libraries: Vec<LibraryUpgradeCandidate>,
}

/// Refresh every configured platform index. Per-URL failures are reported
/// and the rest still refresh; the first failure is returned at the end.
pub async fn update_index(
    registry: &InstanceRegistry,
    id: i32,
    sink: &ProgressSink,
) -> Result<()> {
    let instance = registry.get(id)?;
    let sec = instance.settings().index_security()?;
    let state = instance.lock().await;

    let mut first_error = None;
    for url in instance.settings().index_urls() {
        if let Err(e) = state.package_manager.update_index(&url, &sec, sink).await {
            sink.error(format!("updating index {url}: {e}"));
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Refresh the library index.
pub async fn update_libraries_index(
    registry: &InstanceRegistry,
    id: i32,
    sink: &ProgressSink,
) -> Result<()> {
    let instance = registry.get(id)?;
    let sec = instance.settings().index_security()?;
    let state = instance.lock().await;
    state
        .libraries_manager
        .update_index(
            state.package_manager.client(),
            &instance.settings().library_index_url(),
            &sec,
            sink,
        )
        .await
}

/// Everything upgradeable right now. Pure read, no downloads.
pub async fn outdated(registry: &InstanceRegistry, id: i32) -> Result<OutdatedReport> {
    let instance = registry.get(id)?;
    let state = instance.lock().await;
    let mut report = OutdatedReport::default();

    for candidate in platform_upgrade_candidates(&state) {
        report.platforms.push(candidate);
    }

    for library in state.libraries_manager.libraries.values() {
        if let Some(update) = state.libraries_manager.find_update(&library.name) {
            report.libraries.push(LibraryUpgradeCandidate {
                name: library.name.clone(),
                installed_version: library.version.clone(),
                available_version: update.version.clone(),
            });
        }
    }

    Ok(report)
}

fn platform_upgrade_candidates(state: &InstanceState) -> Vec<PlatformUpgradeCandidate> {
    let pm = &state.package_manager;
    let mut candidates = Vec::new();
    for platform in pm.packages.platforms() {
        let Some(installed) =
            pm.get_installed_platform_release(&platform.package, &platform.architecture)
        else {
            continue;
        };
        let Some(latest) = platform.latest_release() else {
            continue;
        };
        // only releases an index advertises can be fetched
        if latest.resource.is_none() {
            continue;
        }
        if compare_versions(&latest.version, &installed.version) == Ordering::Greater {
            candidates.push(PlatformUpgradeCandidate {
                package: platform.package.clone(),
                architecture: platform.architecture.clone(),
                installed_version: installed.version.clone(),
                latest_version: latest.version.clone(),
            });
        }
    }
    candidates
}

/// Install one platform release with its tool dependencies, replacing any
/// previously installed release of the same platform.
///
/// Single-target: any outcome other than a completed install is an error,
/// including the rolled-back case where the requested release ended up off
/// disk again. Only `upgrade` reports per-target outcomes as statuses.
pub async fn install_platform(
    registry: &InstanceRegistry,
    id: i32,
    reference: &PlatformReference,
    sink: &ProgressSink,
    skip_post_install: bool,
) -> Result<()> {
    let instance = registry.get(id)?;
    let state = instance.lock().await;
    match install_platform_locked(&state, reference, sink, skip_post_install).await? {
        UpgradeStatus::Upgraded => Ok(()),
        UpgradeStatus::Failed(message) | UpgradeStatus::RollbackFailed(message) => {
            Err(CoriumError::FailedInstall {
                what: reference.to_string(),
                message,
            })
        }
    }
}

async fn install_platform_locked(
    state: &InstanceState,
    reference: &PlatformReference,
    sink: &ProgressSink,
    skip_post_install: bool,
) -> Result<UpgradeStatus> {
    let pm = &state.package_manager;
    let (release, tools) = pm.find_platform_release_dependencies(reference)?;

    let old = pm
        .get_installed_platform_release(&reference.package, &reference.architecture)
        .filter(|o| o.version != release.version);

    let tools_to_install: Vec<&ToolRelease> = tools
        .iter()
        .filter(|t| !t.is_installed(pm.packages_dir()))
        .collect();

    // all downloads happen before any install
    for tool in &tools_to_install {
        pm.download_tool_release(tool, sink).await?;
    }
    pm.download_platform_release(&release, sink).await?;

    // installed tools stay even if a later step fails; they are harmless
    // and a retry will not redo the work
    for tool in &tools_to_install {
        sink.task_started(format!("Installing {tool}"));
        pm.install_tool_release(tool)?;
        sink.task_completed(format!("Installed {tool}"));
    }

    sink.task_started(format!("Installing {release}"));
    pm.install_platform_release(&release)?;
    sink.task_completed(format!("Installed {release}"));

    if let Some(old) = &old {
        if let Err(uninstall_err) = pm.uninstall_platform_release(old) {
            // removing the superseded release failed: take the new one back
            // out so the installed set stays consistent
            return match pm.uninstall_platform_release(&release) {
                Ok(()) => Ok(UpgradeStatus::Failed(format!(
                    "removing superseded release {old}: {uninstall_err}"
                ))),
                Err(rollback_err) => Err(CoriumError::RollbackFailed {
                    platform: format!("{}:{}", reference.package, reference.architecture),
                    old_version: old.version.clone(),
                    new_version: release.version.clone(),
                    message: rollback_err.to_string(),
                }),
            };
        }
        collect_unused_tools(state, old, sink);
    }

    if !skip_post_install {
        if let Err(e) = pm.run_post_install_script(&release) {
            // warning only, the platform itself installed fine
            sink.error(format!("post-install script for {release}: {e}"));
        }
    }

    Ok(UpgradeStatus::Upgraded)
}

/// Uninstall tools no installed platform release depends on anymore,
/// scoped to the release that was just removed. Failures are reported,
/// never fatal.
///
/// Index-known releases carry their dependency list, so only those edges
/// need rechecking. A release known only from a disk scan has no list;
/// for those every installed tool of the same package is a candidate.
fn collect_unused_tools(state: &InstanceState, removed: &PlatformRelease, sink: &ProgressSink) {
    let pm = &state.package_manager;

    let disk_only = removed.resource.is_none() && removed.tool_dependencies.is_empty();
    let candidates: Vec<ToolRelease> = if disk_only {
        pm.packages
            .find_package(&removed.package)
            .map(|p| {
                p.tools
                    .values()
                    .flat_map(|t| t.releases.values())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    } else {
        removed
            .tool_dependencies
            .iter()
            .filter_map(|dep| {
                pm.packages
                    .find_tool_release(&dep.packager, &dep.name, &dep.version)
                    .cloned()
            })
            .collect()
    };

    for tool in candidates {
        if !tool.is_installed(pm.packages_dir()) || pm.is_tool_required(&tool) {
            continue;
        }
        match pm.uninstall_tool_release(&tool) {
            Ok(()) => sink.task_completed(format!("Uninstalled unused {tool}")),
            Err(e) => sink.error(format!("removing unused tool {tool}: {e}")),
        }
    }
}

/// Uninstall an installed platform release and garbage-collect the tools
/// only it needed.
pub async fn uninstall_platform(
    registry: &InstanceRegistry,
    id: i32,
    reference: &PlatformReference,
    sink: &ProgressSink,
) -> Result<()> {
    let instance = registry.get(id)?;
    let state = instance.lock().await;
    let pm = &state.package_manager;

    let release = pm.find_platform_release(reference)?;
    pm.uninstall_platform_release(&release)?;
    sink.task_completed(format!("Uninstalled {release}"));

    collect_unused_tools(&state, &release, sink);
    Ok(())
}

/// Upgrade everything: user libraries first, then every outdated platform.
///
/// Per-target failures never abort the transaction; each target's result is
/// reported individually. The one exception is a failed rollback, which
/// leaves the installed set inconsistent and is surfaced as its own status.
pub async fn upgrade(
    registry: &InstanceRegistry,
    id: i32,
    sink: &ProgressSink,
    skip_post_install: bool,
) -> Result<UpgradeReport> {
    let instance = registry.get(id)?;
    let mut state = instance.lock().await;
    let mut report = UpgradeReport::default();

    // libraries
    let library_updates: Vec<(String, String)> = state
        .libraries_manager
        .libraries
        .values()
        .filter_map(|lib| {
            state
                .libraries_manager
                .find_update(&lib.name)
                .map(|_| (lib.name.clone(), lib.version.clone()))
        })
        .collect();

    for (name, from_version) in library_updates {
        let Some(update) = state.libraries_manager.find_update(&name).cloned() else {
            continue;
        };
        sink.task_started(format!("Upgrading library {name}@{}", update.version));
        let result = state
            .libraries_manager
            .install(&update, state.package_manager.client(), sink)
            .await;
        let status = match result {
            Ok(LibraryInstallOutcome::Installed) => UpgradeStatus::Upgraded,
            Ok(LibraryInstallOutcome::AlreadyInstalled) => {
                // not an error, just nothing to do
                sink.task_message(format!("Library {name} is already installed"));
                continue;
            }
            Err(e) => {
                sink.error(format!("upgrading library {name}: {e}"));
                UpgradeStatus::Failed(e.to_string())
            }
        };
        report.libraries.push(LibraryUpgrade {
            name,
            from_version,
            to_version: update.version,
            status,
        });
    }
    // pick up the new library versions
    for e in state.libraries_manager.rescan_libraries() {
        sink.error(e.to_string());
    }

    // platforms
    for candidate in platform_upgrade_candidates(&state) {
        let reference = PlatformReference {
            package: candidate.package.clone(),
            architecture: candidate.architecture.clone(),
            version: candidate.latest_version.clone(),
        };
        let status = match install_platform_locked(&state, &reference, sink, skip_post_install)
            .await
        {
            Ok(status) => status,
            Err(CoriumError::RollbackFailed { message, .. }) => {
                sink.error(format!(
                    "rollback of {}:{} failed, both {} and {} are installed",
                    candidate.package,
                    candidate.architecture,
                    candidate.installed_version,
                    candidate.latest_version
                ));
                UpgradeStatus::RollbackFailed(message)
            }
            Err(e) => {
                sink.error(format!(
                    "upgrading {}:{}: {e}",
                    candidate.package, candidate.architecture
                ));
                UpgradeStatus::Failed(e.to_string())
            }
        };
        report.platforms.push(PlatformUpgrade {
            package: candidate.package,
            architecture: candidate.architecture,
            from_version: candidate.installed_version,
            to_version: candidate.latest_version,
            status,
        });
    }

    Ok(report)
}
