//! Watch command: run a manager and print what it reports.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use crossbeam_channel::Receiver;

use crate::cli::WatchArgs;
use crate::config::Settings;
use crate::watcher::{ClassifiedEvent, WatchError, WatchManager};

/// Exit status when the watched root disappears.
pub const EXIT_ROOT_DELETED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Run the watch command until Ctrl-C or root deletion.
pub async fn run_watch(args: WatchArgs, settings: &Settings) -> anyhow::Result<i32> {
    let config = args.apply(&settings.watcher);
    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let manager = WatchManager::builder(&args.dir)
        .config(&config)
        .build()
        .context("failed to create watcher")?;
    manager
        .start()
        .with_context(|| format!("failed to watch {}", args.dir.display()))?;

    if args.list_descriptors {
        for path in manager.list_descriptors() {
            eprintln!("watching {}", path.display());
        }
    }
    eprintln!("Watching {} (Ctrl-C to stop)", manager.root().display());

    let manager = Arc::new(manager);
    let events = manager.events();
    let errors = manager.errors();
    let printer = tokio::task::spawn_blocking(move || print_events(&events, format));
    let reporter = tokio::task::spawn_blocking(move || report_errors(&errors));

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || manager.wait())
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            eprintln!("Received shutdown signal");
            manager.stop()?;
        }
        finished = waiter => {
            finished.context("watch task failed")??;
        }
    }

    // Output queues close once every sender is gone.
    drop(manager);
    printer.await.context("event printer failed")?;
    let root_deleted = reporter.await.context("error reporter failed")?;

    Ok(if root_deleted { EXIT_ROOT_DELETED } else { 0 })
}

/// Render one event in the requested format.
pub fn format_event(event: &ClassifiedEvent, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => event.to_string(),
        OutputFormat::Json => serde_json::to_string(event).unwrap_or_else(|e| {
            tracing::warn!("[cli] failed to encode event: {e}");
            event.to_string()
        }),
    }
}

fn print_events(events: &Receiver<ClassifiedEvent>, format: OutputFormat) {
    let stdout = std::io::stdout();
    for event in events {
        let mut out = stdout.lock();
        if writeln!(out, "{}", format_event(&event, format))
            .and_then(|()| out.flush())
            .is_err()
        {
            // stdout closed, e.g. piped into `head`
            break;
        }
    }
}

/// Print errors to stderr. Returns whether the root was deleted.
fn report_errors(errors: &Receiver<WatchError>) -> bool {
    let mut root_deleted = false;
    for error in errors {
        eprintln!("Error: {error}");
        root_deleted |= matches!(error, WatchError::RootDeleted { .. });
    }
    root_deleted
}
