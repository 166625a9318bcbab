//! CLI module for the directory watcher.
//!
//! Provides command-line interface parsing and command dispatch.

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, WatchArgs};

use std::path::Path;

use crate::config::Settings;
use crate::watcher::WatchError;

/// Load settings from `path`, or from the usual locations when none is given.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, WatchError> {
    let loaded = match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    loaded.map_err(|e| WatchError::Config {
        reason: e.to_string(),
    })
}
