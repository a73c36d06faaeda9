//! Procman is a small process supervisor. It reads an ecosystem file that
//! describes one or more apps, launches each app with the environment of the
//! selected deployment mode, restarts apps that exit unexpectedly, and
//! restarts watched apps when their files change.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Spawning and terminating child processes.
pub mod process;

/// Supervisor runtime and restart policy.
pub mod supervisor;

/// Polling file watcher.
pub mod watcher;

#[doc(hidden)]
pub mod test_utils;
