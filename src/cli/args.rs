//! CLI argument parsing using clap.

use clap::{
    Args, Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

use crate::config::WatcherConfig;
use crate::watcher::EventKind;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Recursive directory watcher
#[derive(Parser, Debug)]
#[command(
    name = "dirwatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Recursive directory watcher",
    long_about = "Watch a directory tree, following new and removed subdirectories, and print classified change events.",
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch a directory and print events until interrupted
    Watch(WatchArgs),

    /// Display active settings
    Config,

    /// Set up .dirwatch/settings.toml in the current directory
    Init {
        /// Overwrite an existing settings file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Directory to watch
    pub dir: PathBuf,

    /// Watch only the directory itself, not its subdirectories
    #[arg(long)]
    pub no_recursive: bool,

    /// Honor per-directory flag overrides instead of the watcher-wide mask
    #[arg(long)]
    pub no_watcher_flags: bool,

    /// Event kinds to print, comma separated (e.g. dir_created,file_changed)
    #[arg(long, value_delimiter = ',')]
    pub interest: Vec<EventKind>,

    /// Bound the event queue; unbounded by default
    #[arg(long, value_name = "N")]
    pub queue_capacity: Option<usize>,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Print the watched directories after startup
    #[arg(long)]
    pub list_descriptors: bool,
}

impl WatchArgs {
    /// Apply command-line overrides on top of the configured watcher settings.
    pub fn apply(&self, config: &WatcherConfig) -> WatcherConfig {
        let mut config = config.clone();
        if self.no_recursive {
            config.recursive = false;
        }
        if self.no_watcher_flags {
            config.use_watcher_flags = false;
        }
        if !self.interest.is_empty() {
            config.interest = self.interest.clone();
        }
        if self.queue_capacity.is_some() {
            config.queue.capacity = self.queue_capacity;
        }
        config
    }
}
