//! Instance registry and the per-instance initialization sequence.
//!
//! Callers hold integer instance ids, never the instances themselves. Each
//! instance owns one package manager and one libraries manager behind an
//! async mutex, so operations against the same instance serialize while
//! distinct instances proceed independently.

use crate::error::{CoriumError, Result};
use crate::events::ProgressSink;
use crate::library::{LibrariesManager, LibraryLocation};
use crate::package_manager::PackageManager;
use crate::settings::Settings;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// The managers of one instance, guarded together so an operation sees a
/// consistent pair.
pub struct InstanceState {
    pub package_manager: PackageManager,
    pub libraries_manager: LibrariesManager,
}

pub struct CoreInstance {
    id: i32,
    settings: Settings,
    state: Mutex<InstanceState>,
}

impl std::fmt::Debug for CoreInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreInstance").field("id", &self.id).finish()
    }
}

impl CoreInstance {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Exclusive access to the instance state. Held across an entire
    /// operation so concurrent calls against the same instance serialize.
    pub async fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().await
    }

    /// (Re)load the instance: indexes, installed hardware, built-in tools,
    /// discovery checks and libraries.
    ///
    /// Best-effort: every failure is reported through `sink` and
    /// the remaining steps still run, so one unreachable third-party index
    /// cannot brick an instance. Safe to call repeatedly; state is rebuilt
    /// from scratch each time.
    pub async fn init(&self, sink: &ProgressSink) {
        let mut state = self.lock().await;

        // 1. indexes
        state.package_manager.clear();
        for url in self.settings.index_urls() {
            sink.task_started(format!("Loading index: {url}"));
            if let Err(e) = state.package_manager.load_package_index(&url) {
                sink.error(format!("loading index {url}: {e}"));
                continue;
            }
            sink.task_completed(format!("Loaded index: {url}"));
        }

        // 2. installed hardware
        for e in state.package_manager.load_hardware() {
            sink.error(e.to_string());
        }

        // 3. built-in tools
        let tools_installed = self.install_builtin_tools(&mut state, sink).await;

        // 4. pick up hardware state changed by tool installs
        if tools_installed {
            for e in state.package_manager.load_hardware() {
                sink.error(e.to_string());
            }
        }

        // 5. discovery requirements
        for e in state.package_manager.load_discoveries() {
            sink.error(e.to_string());
        }

        // 6. libraries
        self.register_bundled_library_dirs(&mut state);
        if let Err(e) = state.libraries_manager.load_index() {
            sink.error(format!("loading library index: {e}"));
        }
        for e in state.libraries_manager.rescan_libraries() {
            sink.error(e.to_string());
        }

        // 7. locale
        if let Some(locale) = self.settings.locale() {
            tracing::debug!(%locale, instance = self.id, "instance locale");
        }
    }

    /// Install the latest release of every tool in the reserved `builtin`
    /// package that is not on disk yet. Returns true if anything was
    /// installed.
    async fn install_builtin_tools(
        &self,
        state: &mut InstanceState,
        sink: &ProgressSink,
    ) -> bool {
        let pm = &state.package_manager;
        let Some(builtin) = pm.packages.find_package("builtin") else {
            return false;
        };

        let mut to_install = Vec::new();
        for tool in builtin.tools.values() {
            match tool.latest_release() {
                Some(latest) => {
                    if !latest.is_installed(pm.packages_dir()) {
                        to_install.push(latest.clone());
                    }
                }
                None => sink.error(format!("built-in tool {} has no releases", tool.name)),
            }
        }

        let mut installed_any = false;
        for tool in to_install {
            sink.task_started(format!("Installing {tool}"));
            let result = async {
                pm.download_tool_release(&tool, sink).await?;
                pm.install_tool_release(&tool)
            }
            .await;
            match result {
                Ok(()) => {
                    sink.task_completed(format!("Installed {tool}"));
                    installed_any = true;
                }
                Err(e) => sink.error(format!("installing built-in tool {tool}: {e}")),
            }
        }
        installed_any
    }

    /// Register the `libraries/` dir bundled inside each installed platform
    /// release, so their libraries show up in scans at lower precedence
    /// than the user's own.
    fn register_bundled_library_dirs(&self, state: &mut InstanceState) {
        let mut bundled = Vec::new();
        for platform in state.package_manager.packages.platforms() {
            if let Some(release) = state
                .package_manager
                .get_installed_platform_release(&platform.package, &platform.architecture)
            {
                let dir = release
                    .install_dir(state.package_manager.packages_dir())
                    .join("libraries");
                if dir.is_dir() {
                    bundled.push(dir);
                }
            }
        }
        for dir in bundled {
            state
                .libraries_manager
                .add_libraries_dir(dir, LibraryLocation::PlatformBuiltIn);
        }
    }
}

/// Process-wide map from instance id to instance.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: std::sync::Mutex<HashMap<i32, Arc<CoreInstance>>>,
    next_id: AtomicI32,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
        }
    }

    /// Create a new instance from a configuration source. Creates the data
    /// directories; does not touch the network (see [`CoreInstance::init`]).
    pub fn create(&self, settings: Option<Settings>) -> Result<i32> {
        let settings = settings.ok_or(CoriumError::MissingConfiguration)?;

        for dir in [settings.packages_dir(), settings.downloads_dir()] {
            fs::create_dir_all(&dir).map_err(|source| CoriumError::PermissionDenied {
                message: format!("creating data directory {}", dir.display()),
                source,
            })?;
        }

        let package_manager = PackageManager::new(
            settings.data_dir(),
            settings.packages_dir(),
            settings.downloads_dir(),
            settings.tmp_dir(),
        )?;

        let mut libraries_manager = LibrariesManager::new(
            &settings.data_dir(),
            settings.downloads_dir(),
            settings.tmp_dir(),
        );
        if let Some(dir) = settings.libraries_dir() {
            libraries_manager.add_libraries_dir(dir, LibraryLocation::User);
        }
        if let Some(dir) = settings.builtin_libraries_dir() {
            libraries_manager.add_libraries_dir(dir, LibraryLocation::IdeBuiltIn);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let instance = Arc::new(CoreInstance {
            id,
            settings,
            state: Mutex::new(InstanceState {
                package_manager,
                libraries_manager,
            }),
        });

        self.instances
            .lock()
            .expect("instance registry poisoned")
            .insert(id, instance);
        tracing::debug!(instance = id, "instance created");
        Ok(id)
    }

    pub fn get(&self, id: i32) -> Result<Arc<CoreInstance>> {
        self.instances
            .lock()
            .expect("instance registry poisoned")
            .get(&id)
            .cloned()
            .ok_or(CoriumError::InvalidInstance(id))
    }

    /// Drop an instance. In-flight operations holding the instance's Arc
    /// finish normally; new lookups fail.
    pub fn destroy(&self, id: i32) -> Result<()> {
        self.instances
            .lock()
            .expect("instance registry poisoned")
            .remove(&id)
            .map(|_| tracing::debug!(instance = id, "instance destroyed"))
            .ok_or(CoriumError::InvalidInstance(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_for(dir: &std::path::Path) -> Settings {
        let mut s = Settings::default();
        s.set("directories.data", dir.display().to_string());
        s
    }

    #[test]
    fn test_create_requires_settings() {
        let registry = InstanceRegistry::new();
        assert!(matches!(
            registry.create(None).unwrap_err(),
            CoriumError::MissingConfiguration
        ));
    }

    #[test]
    fn test_ids_are_unique_and_lookup_follows_lifecycle() {
        let env = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::new();

        let a = registry.create(Some(settings_for(env.path()))).unwrap();
        let b = registry.create(Some(settings_for(env.path()))).unwrap();
        assert_ne!(a, b);

        assert_eq!(registry.get(a).unwrap().id(), a);
        registry.destroy(a).unwrap();
        assert!(matches!(
            registry.get(a).unwrap_err(),
            CoriumError::InvalidInstance(id) if id == a
        ));
        assert!(matches!(
            registry.destroy(a).unwrap_err(),
            CoriumError::InvalidInstance(_)
        ));
        assert!(registry.get(b).is_ok());
    }

    #[test]
    fn test_create_builds_data_directories() {
        let env = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::new();
        registry.create(Some(settings_for(env.path()))).unwrap();

        assert!(env.path().join("packages").is_dir());
        assert!(env.path().join("staging").is_dir());
    }
}
