//! Watch manager: keeps the registry in step with the live tree.
//!
//! Records flow from the source's own thread into an internal queue. A
//! dedicated reconcile thread drains that queue, classifies each record,
//! installs or removes descriptors for structural changes, and republishes
//! the classified events and any errors on two outbound queues.
//!
//! ```text
//! source thread --RecordSink--> [record queue] --> reconcile thread
//!                                                    |  classify
//!                                                    |  registry add/remove
//!                                                    +--> events()
//!                                                    +--> errors()
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::{Mutex, RwLock};

use super::classifier::{ClassifiedEvent, Classifier, EventKind};
use super::descriptor::Descriptor;
use super::error::{RegistrationReason, SourceError, WatchError, WatchResult};
use super::mask::EventMask;
use super::notify_source::NotifySource;
use super::registry::{DescriptorRegistry, PopulateReport, RegistryOptions, normalize_path};
use super::source::{NotificationSource, RawRecord, RecordSink, SourceMessage};
use crate::config::WatcherConfig;

/// Lifecycle state of a [`WatchManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Running,
}

type SourceFactory =
    Box<dyn FnOnce(RecordSink) -> WatchResult<Arc<dyn NotificationSource>> + Send>;

/// Recursive directory watcher with an explicit start/stop lifecycle.
///
/// A manager runs at most once: after it stops, either through
/// [`stop`](Self::stop) or because its root was deleted, it cannot be
/// restarted.
pub struct WatchManager {
    root: PathBuf,
    recursive: bool,
    interest: Vec<EventKind>,
    registry: Arc<RwLock<DescriptorRegistry>>,
    source: Arc<dyn NotificationSource>,
    records: Receiver<SourceMessage>,
    events: (Sender<ClassifiedEvent>, Receiver<ClassifiedEvent>),
    errors: (Sender<WatchError>, Receiver<WatchError>),
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl WatchManager {
    /// Create a builder for watching `root`.
    pub fn builder(root: impl Into<PathBuf>) -> WatchManagerBuilder {
        WatchManagerBuilder::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> ManagerState {
        if self.running.load(Ordering::SeqCst) {
            ManagerState::Running
        } else {
            ManagerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// Classified events. Receivers can be cloned and shared.
    pub fn events(&self) -> Receiver<ClassifiedEvent> {
        self.events.1.clone()
    }

    /// Errors raised while reconciling in the background.
    pub fn errors(&self) -> Receiver<WatchError> {
        self.errors.1.clone()
    }

    /// Register the tree and start the reconcile loop.
    ///
    /// Failing to register the root is returned here and leaves the manager
    /// stopped. Failures below the root are reported on [`errors`](Self::errors).
    pub fn start(&self) -> WatchResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.started {
            return Err(WatchError::InvalidState {
                reason: "watcher has already been started".to_string(),
            });
        }

        let report = {
            let mut registry = self.registry.write();
            if self.recursive {
                registry.populate_recursive(&self.root)?
            } else {
                registry.add(&self.root, None)?;
                registry.start(&self.root)?;
                PopulateReport {
                    registered: 1,
                    ..PopulateReport::default()
                }
            }
        };

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let worker = ReconcileLoop {
            classifier: Classifier::new(&self.root),
            recursive: self.recursive,
            interest: self.interest.clone(),
            registry: Arc::clone(&self.registry),
            source: Arc::clone(&self.source),
            records: self.records.clone(),
            events: self.events.0.clone(),
            errors: self.errors.0.clone(),
            shutdown: shutdown_rx,
            running: Arc::clone(&self.running),
        };

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("dirwatch-reconcile".to_string())
            .spawn(move || worker.run(report.failures))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                WatchError::InitFailed {
                    reason: format!("failed to spawn reconcile thread: {e}"),
                }
            })?;

        lifecycle.started = true;
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.worker = Some(handle);

        crate::log_event!(
            "watcher",
            "started",
            "{} ({} directories, source: {})",
            self.root.display(),
            report.registered,
            self.source.name()
        );
        Ok(())
    }

    /// Stop the loop, release every handle and close the source.
    ///
    /// Safe to call more than once and after the root has been deleted.
    pub fn stop(&self) -> WatchResult<()> {
        let (shutdown, worker) = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.started = true;
            (lifecycle.shutdown.take(), lifecycle.worker.take())
        };

        // Dropping the sender wakes the loop wherever it is blocked.
        drop(shutdown);
        let joined = match worker {
            Some(worker) => worker.join().map_err(|_| WatchError::InvalidState {
                reason: "reconcile loop panicked".to_string(),
            }),
            None => Ok(()),
        };

        teardown(&self.registry, self.source.as_ref());
        self.running.store(false, Ordering::SeqCst);
        joined
    }

    /// Block until the reconcile loop exits, by [`stop`](Self::stop) or
    /// because the root was deleted.
    pub fn wait(&self) -> WatchResult<()> {
        let worker = self.lifecycle.lock().worker.take();
        match worker {
            Some(worker) => worker.join().map_err(|_| WatchError::InvalidState {
                reason: "reconcile loop panicked".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Watched directories in sorted order.
    pub fn list_descriptors(&self) -> Vec<PathBuf> {
        self.registry.read().list()
    }

    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<Descriptor> {
        self.registry.read().lookup(path).cloned()
    }

    /// Register a directory by hand. The descriptor stays pending until
    /// [`start_descriptor`](Self::start_descriptor) is called.
    pub fn add_descriptor(
        &self,
        path: impl AsRef<Path>,
        flags_override: Option<EventMask>,
    ) -> WatchResult<Descriptor> {
        self.registry.write().add(path, flags_override)
    }

    pub fn start_descriptor(&self, path: impl AsRef<Path>) -> WatchResult<()> {
        self.registry.write().start(path)
    }

    pub fn stop_descriptor(&self, path: impl AsRef<Path>) -> WatchResult<()> {
        self.registry.write().stop(path)
    }

    pub fn remove_descriptor(&self, path: impl AsRef<Path>) -> WatchResult<()> {
        self.registry.write().remove(path).map(|_| ())
    }

    /// Resume delivery for every descriptor. Returns how many changed state.
    pub fn start_all(&self) -> usize {
        self.registry.write().start_all()
    }

    /// Suspend delivery for every descriptor without releasing handles.
    /// Returns how many changed state.
    pub fn stop_all(&self) -> usize {
        self.registry.write().stop_all()
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("[watcher] shutdown failed: {e}");
        }
    }
}

fn teardown(registry: &RwLock<DescriptorRegistry>, source: &dyn NotificationSource) {
    let released = registry.write().clear();
    source.close();
    if released > 0 {
        crate::debug_event!("watcher", "released", "{released} descriptors");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Halt,
}

/// State moved onto the reconcile thread.
struct ReconcileLoop {
    classifier: Classifier,
    recursive: bool,
    interest: Vec<EventKind>,
    registry: Arc<RwLock<DescriptorRegistry>>,
    source: Arc<dyn NotificationSource>,
    records: Receiver<SourceMessage>,
    events: Sender<ClassifiedEvent>,
    errors: Sender<WatchError>,
    shutdown: Receiver<()>,
    running: Arc<AtomicBool>,
}

impl ReconcileLoop {
    fn run(self, startup_failures: Vec<WatchError>) {
        let mut flow = Flow::Continue;
        for failure in startup_failures {
            flow = self.emit_error(failure);
            if flow == Flow::Halt {
                break;
            }
        }

        while flow == Flow::Continue {
            select! {
                recv(self.records) -> message => {
                    flow = match message {
                        Ok(SourceMessage::Record(record)) => self.on_record(record),
                        Ok(SourceMessage::Error(error)) => self.on_source_error(error),
                        Err(_) => Flow::Halt,
                    };
                }
                recv(self.shutdown) -> _ => flow = Flow::Halt,
            }
        }

        teardown(&self.registry, self.source.as_ref());
        self.running.store(false, Ordering::SeqCst);
        crate::log_event!("watcher", "stopped", "{}", self.classifier.root().display());
    }

    fn on_record(&self, record: RawRecord) -> Flow {
        if let Some(handle) = record.handle {
            let registry = self.registry.read();
            match registry.lookup_handle(handle) {
                Some(descriptor) if descriptor.is_active() => {}
                Some(descriptor) => {
                    crate::debug_event!(
                        "watcher",
                        "pending, dropped",
                        "{}",
                        descriptor.path().display()
                    );
                    return Flow::Continue;
                }
                None => {
                    crate::debug_event!("watcher", "stale, dropped", "{}", record.path.display());
                    return Flow::Continue;
                }
            }
        }

        for event in self.classifier.classify(&record) {
            crate::debug_event!("watcher", "event", "{event}");
            match event.kind {
                EventKind::RootDeleted => {
                    tracing::error!("[watcher] root {} was deleted", event.path.display());
                    let path = event.path.clone();
                    if self.emit(event) == Flow::Continue {
                        self.emit_error(WatchError::RootDeleted { path });
                    }
                    return Flow::Halt;
                }
                EventKind::DirCreated => {
                    if self.on_dir_created(&event.path) == Flow::Halt {
                        return Flow::Halt;
                    }
                }
                EventKind::DirRemoved => self.on_dir_removed(&event.path),
                _ => {}
            }

            if self.interest.contains(&event.kind) && self.emit(event) == Flow::Halt {
                return Flow::Halt;
            }
        }
        Flow::Continue
    }

    /// Watch a new directory (and anything already inside it) before the
    /// event announcing it is published.
    fn on_dir_created(&self, path: &Path) -> Flow {
        if !self.recursive {
            return Flow::Continue;
        }

        let result = self.registry.write().populate_recursive(path);
        match result {
            Ok(report) => {
                crate::debug_event!(
                    "watcher",
                    "watching",
                    "{} (+{})",
                    path.display(),
                    report.registered
                );
                for failure in report.failures {
                    if self.emit_error(failure) == Flow::Halt {
                        return Flow::Halt;
                    }
                }
                Flow::Continue
            }
            Err(e) if e.is_vanished() => {
                tracing::warn!(
                    "[watcher] {} vanished before it could be watched",
                    path.display()
                );
                Flow::Continue
            }
            Err(WatchError::Registration {
                reason: RegistrationReason::AlreadyWatched,
                ..
            }) => {
                crate::debug_event!("watcher", "already watched", "{}", path.display());
                Flow::Continue
            }
            Err(e) => {
                tracing::warn!("[watcher] {e}");
                self.emit_error(e)
            }
        }
    }

    fn on_dir_removed(&self, path: &Path) {
        let removed = self.registry.write().remove_subtree(path);
        if removed.is_empty() {
            crate::debug_event!("watcher", "not watched", "{}", path.display());
        } else {
            crate::debug_event!(
                "watcher",
                "unwatched",
                "{} ({} descriptors)",
                path.display(),
                removed.len()
            );
        }
    }

    fn on_source_error(&self, error: SourceError) -> Flow {
        let fatal = error.is_fatal();
        if fatal {
            tracing::error!("[watcher] {error}");
        } else {
            tracing::warn!("[watcher] {error}");
        }
        let flow = self.emit_error(WatchError::Source(error));
        if fatal { Flow::Halt } else { flow }
    }

    fn emit(&self, event: ClassifiedEvent) -> Flow {
        send_or_shutdown(&self.events, event, &self.shutdown)
    }

    fn emit_error(&self, error: WatchError) -> Flow {
        send_or_shutdown(&self.errors, error, &self.shutdown)
    }
}

/// Send on a possibly bounded queue, giving up if shutdown is requested.
fn send_or_shutdown<T>(tx: &Sender<T>, value: T, shutdown: &Receiver<()>) -> Flow {
    select! {
        send(tx, value) -> _ => Flow::Continue,
        recv(shutdown) -> _ => Flow::Halt,
    }
}

/// Builder for constructing a [`WatchManager`].
pub struct WatchManagerBuilder {
    root: PathBuf,
    recursive: bool,
    use_watcher_flags: bool,
    interest: Vec<EventKind>,
    queue_capacity: Option<usize>,
    source: Option<SourceFactory>,
}

impl WatchManagerBuilder {
    /// Create a builder with defaults: recursive, watcher-wide flags, every
    /// event kind, unbounded queues, notify backend.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: true,
            use_watcher_flags: true,
            interest: EventKind::ALL.to_vec(),
            queue_capacity: None,
            source: None,
        }
    }

    /// Populate and auto-manage subdirectories.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Apply the watcher-wide mask to every new descriptor.
    pub fn use_watcher_flags(mut self, use_watcher_flags: bool) -> Self {
        self.use_watcher_flags = use_watcher_flags;
        self
    }

    /// Subscribe to the given event kinds. Root deletion is reported
    /// regardless.
    pub fn interest(mut self, kinds: &[EventKind]) -> Self {
        self.interest = kinds.to_vec();
        if !self.interest.contains(&EventKind::RootDeleted) {
            self.interest.push(EventKind::RootDeleted);
        }
        self
    }

    /// Subscribe to every kind signalled by a bit in `mask`.
    pub fn interest_mask(self, mask: EventMask) -> Self {
        let kinds: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|kind| kind.mask().intersects(mask))
            .collect();
        self.interest(&kinds)
    }

    /// Bound the event and error queues. `None` leaves them unbounded, which
    /// lets memory grow without limit if the consumer stalls.
    pub fn queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Apply a `[watcher]` settings section.
    pub fn config(self, config: &WatcherConfig) -> Self {
        self.recursive(config.recursive)
            .use_watcher_flags(config.use_watcher_flags)
            .interest(&config.interest)
            .queue_capacity(config.queue.capacity)
    }

    /// Use a custom notification source instead of notify.
    pub fn source<S, F>(mut self, factory: F) -> Self
    where
        S: NotificationSource + 'static,
        F: FnOnce(RecordSink) -> WatchResult<S> + Send + 'static,
    {
        self.source = Some(Box::new(move |sink| {
            factory(sink).map(|s| Arc::new(s) as Arc<dyn NotificationSource>)
        }));
        self
    }

    /// Build the manager. Nothing is registered until `start`.
    pub fn build(self) -> WatchResult<WatchManager> {
        let root = normalize_path(&self.root);
        let (sink, records) = RecordSink::channel();

        let source: Arc<dyn NotificationSource> = match self.source {
            Some(factory) => factory(sink)?,
            None => Arc::new(NotifySource::new(sink)?),
        };

        let options = RegistryOptions {
            flags: EventKind::mask_of(&self.interest),
            recursive: self.recursive,
            use_watcher_flags: self.use_watcher_flags,
        };
        let registry = DescriptorRegistry::new(&root, options, Arc::clone(&source));

        Ok(WatchManager {
            root,
            recursive: self.recursive,
            interest: self.interest,
            registry: Arc::new(RwLock::new(registry)),
            source,
            records,
            events: queue(self.queue_capacity),
            errors: queue(self.queue_capacity),
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }
}

fn queue<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    match capacity {
        Some(capacity) => bounded(capacity),
        None => unbounded(),
    }
}
