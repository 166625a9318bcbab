//! Recursive directory watching with automatic subdirectory management.
//!
//! ```no_run
//! use dirwatch::WatchManager;
//!
//! # fn main() -> dirwatch::WatchResult<()> {
//! let manager = WatchManager::builder("/srv/data").build()?;
//! manager.start()?;
//! for event in manager.events() {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod logging;
pub mod watcher;

pub use config::Settings;
pub use watcher::{
    ClassifiedEvent, Descriptor, EventKind, EventMask, ManagerState, WatchError, WatchManager,
    WatchManagerBuilder, WatchResult,
};
