//! Lifecycle supervision for game-server worker processes.
//!
//! [`Supervisor`] spawns workers, stops them gracefully or by force, batches their
//! output toward the UI, and reconciles the persisted status of every instance
//! against the processes that are actually alive.

pub mod config;
pub mod error;
pub mod launch;
pub mod liveness;
pub mod locator;
pub mod multiplexer;
pub mod outcome;
pub mod platform;
mod reconcile;
pub mod scanner;
pub mod store;
pub mod supervisor;
pub(crate) mod usage;

#[cfg(test)]
mod testing;

pub use config::SupervisorConfig;
pub use error::{Result, SupervisorError};
pub use locator::{ArtifactLocator, DirectoryLocator};
pub use outcome::Outcome;
pub use platform::{ProcessControl, platform_control};
pub use store::{ConfigStore, JsonFileStore, MemoryConfigStore};
pub use supervisor::{ProcessHandle, Supervisor};
