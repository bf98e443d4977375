//! Session-oriented core for managing embedded toolchain platforms, build
//! tools and libraries.
//!
//! Callers create an instance from a configuration source, initialize it
//! against the configured package indexes, and then run operations against
//! its id: resolving boards, installing and upgrading platforms with their
//! tool dependencies, and managing libraries. All state an operation needs
//! lives inside the instance; nothing global.
//!
//! ```no_run
//! use corium::{InstanceRegistry, ProgressSink, Settings};
//!
//! # async fn demo() -> corium::Result<()> {
//! let registry = InstanceRegistry::new();
//! let mut settings = Settings::default();
//! settings.set("directories.data", "/home/me/.corium");
//! let id = registry.create(Some(settings))?;
//!
//! let sink = ProgressSink::none();
//! corium::commands::update_index(&registry, id, &sink).await?;
//! registry.get(id)?.init(&sink).await;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fqbn;
pub mod index;
pub mod instances;
pub mod library;
pub mod package_manager;
pub mod packages;
pub mod resources;
pub mod security;
pub mod settings;

pub use error::{CoriumError, Result};
pub use events::{DownloadProgress, Event, ProgressSink, TaskProgress};
pub use fqbn::{Fqbn, ResolvedBoard};
pub use instances::{CoreInstance, InstanceRegistry};
pub use packages::PlatformReference;
pub use settings::Settings;
