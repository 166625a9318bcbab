//! Descriptor registry: the set of watched directories.
//!
//! Maps canonical directory paths to their [`Descriptor`]s and owns every
//! handle obtained from the notification source. A handle is released
//! exactly once, when its entry leaves the registry.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::descriptor::{Descriptor, WatchHandle};
use super::error::{RegistrationReason, SourceError, WatchError, WatchResult};
use super::mask::EventMask;
use super::source::NotificationSource;

/// Watcher-wide settings applied to newly registered directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Watcher-wide interest mask.
    pub flags: EventMask,
    /// Populate and auto-manage subdirectories.
    pub recursive: bool,
    /// Always use `flags` for new descriptors, ignoring per-call overrides.
    pub use_watcher_flags: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            flags: EventMask::all(),
            recursive: true,
            use_watcher_flags: true,
        }
    }
}

/// Outcome of a bulk population.
#[derive(Debug, Default)]
pub struct PopulateReport {
    /// Directories newly registered and started.
    pub registered: usize,
    /// Directories that already had a descriptor.
    pub skipped: usize,
    /// Subdirectories that could not be registered or walked.
    pub failures: Vec<WatchError>,
}

/// Registry of watch descriptors keyed by canonical path.
pub struct DescriptorRegistry {
    root: PathBuf,
    options: RegistryOptions,
    source: Arc<dyn NotificationSource>,
    entries: BTreeMap<PathBuf, Descriptor>,
    handles: HashMap<WatchHandle, PathBuf>,
}

impl DescriptorRegistry {
    pub fn new(
        root: impl AsRef<Path>,
        options: RegistryOptions,
        source: Arc<dyn NotificationSource>,
    ) -> Self {
        Self {
            root: normalize_path(root.as_ref()),
            options,
            source,
            entries: BTreeMap::new(),
            handles: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> RegistryOptions {
        self.options
    }

    /// Register `path` with the source and store a pending descriptor.
    ///
    /// The descriptor does not forward records until [`start`](Self::start)
    /// is called for it.
    pub fn add(
        &mut self,
        path: impl AsRef<Path>,
        flags_override: Option<EventMask>,
    ) -> WatchResult<Descriptor> {
        let path = normalize_path(path.as_ref());

        if self.entries.contains_key(&path) {
            return Err(WatchError::registration(
                path,
                RegistrationReason::AlreadyWatched,
            ));
        }

        if let Err(reason) = check_directory(&path) {
            return Err(WatchError::registration(path, reason));
        }

        let flags = self.effective_flags(&path, flags_override);
        let handle = self
            .source
            .register(&path, flags)
            .map_err(|reason| WatchError::registration(&path, reason))?;

        let descriptor = Descriptor::pending(path.clone(), handle, flags);
        self.handles.insert(handle, path.clone());
        self.entries.insert(path.clone(), descriptor.clone());

        crate::debug_event!("registry", "added", "{} ({handle})", path.display());
        Ok(descriptor)
    }

    /// Enable record delivery for `path`. No-op if already active.
    pub fn start(&mut self, path: impl AsRef<Path>) -> WatchResult<()> {
        let path = normalize_path(path.as_ref());
        let descriptor = self
            .entries
            .get_mut(&path)
            .ok_or_else(|| WatchError::NotFound { path: path.clone() })?;
        if descriptor.start() {
            crate::debug_event!("registry", "started", "{}", path.display());
        }
        Ok(())
    }

    /// Suspend record delivery for `path`. No-op if already pending.
    pub fn stop(&mut self, path: impl AsRef<Path>) -> WatchResult<()> {
        let path = normalize_path(path.as_ref());
        let descriptor = self
            .entries
            .get_mut(&path)
            .ok_or_else(|| WatchError::NotFound { path: path.clone() })?;
        if descriptor.stop() {
            crate::debug_event!("registry", "stopped", "{}", path.display());
        }
        Ok(())
    }

    /// Start every pending descriptor. Returns how many changed state.
    pub fn start_all(&mut self) -> usize {
        self.entries
            .values_mut()
            .map(|d| d.start())
            .filter(|changed| *changed)
            .count()
    }

    /// Stop every active descriptor. Returns how many changed state.
    pub fn stop_all(&mut self) -> usize {
        self.entries
            .values_mut()
            .map(|d| d.stop())
            .filter(|changed| *changed)
            .count()
    }

    /// Release the handle for `path` and forget it.
    ///
    /// Works for directories that are already gone from disk, and for
    /// handles the source has already dropped on its own.
    pub fn remove(&mut self, path: impl AsRef<Path>) -> WatchResult<Descriptor> {
        let path = normalize_path(path.as_ref());
        let descriptor = self
            .entries
            .remove(&path)
            .ok_or_else(|| WatchError::NotFound { path: path.clone() })?;
        self.handles.remove(&descriptor.handle());
        self.release(&descriptor);

        crate::debug_event!("registry", "removed", "{}", path.display());
        Ok(descriptor)
    }

    /// Remove `path` and every watched directory below it.
    ///
    /// A directory moved out of the tree is reported once, for its top
    /// level; its descendants would otherwise keep stale entries.
    pub fn remove_subtree(&mut self, path: impl AsRef<Path>) -> Vec<Descriptor> {
        let path = normalize_path(path.as_ref());
        let doomed: Vec<PathBuf> = self
            .entries
            .range(path.clone()..)
            .map(|(p, _)| p)
            .take_while(|p| p.starts_with(&path))
            .cloned()
            .collect();

        doomed
            .into_iter()
            .filter_map(|p| self.remove(&p).ok())
            .collect()
    }

    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<&Descriptor> {
        self.entries.get(&normalize_path(path.as_ref()))
    }

    pub fn lookup_handle(&self, handle: WatchHandle) -> Option<&Descriptor> {
        self.handles.get(&handle).and_then(|p| self.entries.get(p))
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.entries.contains_key(&normalize_path(path.as_ref()))
    }

    /// Watched paths in sorted order.
    pub fn list(&self) -> Vec<PathBuf> {
        self.entries.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register and start `dir` and every directory below it, depth-first.
    ///
    /// Failing to register `dir` itself is returned as an error. Failures
    /// further down are collected in the report and do not stop the walk;
    /// the walk does not descend into a directory that failed.
    pub fn populate_recursive(&mut self, dir: impl AsRef<Path>) -> WatchResult<PopulateReport> {
        let dir = normalize_path(dir.as_ref());
        let mut report = PopulateReport::default();

        if self.contains(&dir) {
            report.skipped += 1;
        } else {
            self.add(&dir, None)?;
            report.registered += 1;
        }
        self.start(&dir)?;

        let mut walker = WalkDir::new(&dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(&dir).to_path_buf();
                    tracing::warn!("[registry] walk failed at {}: {e}", path.display());
                    report.failures.push(WatchError::Traversal {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_dir() {
                continue;
            }

            let path = entry.path();
            if self.contains(path) {
                report.skipped += 1;
                continue;
            }

            match self.add(path, None).and_then(|d| self.start(d.path())) {
                Ok(()) => report.registered += 1,
                Err(e) => {
                    tracing::warn!("[registry] {e}");
                    report.failures.push(e);
                    walker.skip_current_dir();
                }
            }
        }

        crate::debug_event!(
            "registry",
            "populated",
            "{} ({} new, {} known, {} failed)",
            dir.display(),
            report.registered,
            report.skipped,
            report.failures.len()
        );
        Ok(report)
    }

    /// Release every handle and empty the registry. Returns the number released.
    pub fn clear(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);
        self.handles.clear();
        for descriptor in entries.values() {
            self.release(descriptor);
        }
        entries.len()
    }

    fn effective_flags(&self, path: &Path, flags_override: Option<EventMask>) -> EventMask {
        let mut flags = match flags_override {
            Some(flags) if !self.options.use_watcher_flags => flags,
            Some(_) => {
                crate::debug_event!(
                    "registry",
                    "override ignored",
                    "{} uses watcher flags",
                    path.display()
                );
                self.options.flags
            }
            None => self.options.flags,
        };
        if self.options.recursive {
            flags |= EventMask::STRUCTURAL;
        }
        if path == self.root {
            flags |= EventMask::SELF_EVENTS;
        }
        flags
    }

    fn release(&self, descriptor: &Descriptor) {
        match self.source.unregister(descriptor.handle()) {
            Ok(()) => {}
            Err(SourceError::UnknownHandle(_)) => {
                crate::debug_event!(
                    "registry",
                    "already released",
                    "{}",
                    descriptor.path().display()
                );
            }
            Err(e) => {
                tracing::warn!(
                    "[registry] failed to release {}: {e}",
                    descriptor.path().display()
                );
            }
        }
    }
}

impl std::fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("root", &self.root)
            .field("options", &self.options)
            .field("source", &self.source.name())
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Canonicalize `path` if it exists, otherwise clean it lexically.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Confirm `path` is a directory the process can read.
fn check_directory(path: &Path) -> Result<(), RegistrationReason> {
    let metadata = std::fs::metadata(path).map_err(io_reason)?;
    if !metadata.is_dir() {
        return Err(RegistrationReason::NotADirectory);
    }
    std::fs::read_dir(path).map(|_| ()).map_err(io_reason)
}

pub(crate) fn io_reason(e: io::Error) -> RegistrationReason {
    match e.kind() {
        io::ErrorKind::NotFound => RegistrationReason::Missing,
        io::ErrorKind::PermissionDenied => RegistrationReason::PermissionDenied,
        _ => RegistrationReason::Rejected(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::memory::MemorySource;
    use crate::watcher::source::RecordSink;
    use std::fs;
    use tempfile::TempDir;

    fn setup(options: RegistryOptions) -> (TempDir, MemorySource, DescriptorRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let (sink, _rx) = RecordSink::channel();
        let source = MemorySource::new(sink);
        let registry = DescriptorRegistry::new(temp_dir.path(), options, Arc::new(source.clone()));
        (temp_dir, source, registry)
    }

    #[test]
    fn test_add_is_pending_until_started() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());

        let descriptor = registry.add(temp_dir.path(), None).unwrap();
        assert!(!descriptor.is_active());
        assert_eq!(source.registered_count(), 1);

        registry.start(temp_dir.path()).unwrap();
        registry.start(temp_dir.path()).unwrap();
        assert!(registry.lookup(temp_dir.path()).unwrap().is_active());
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let (temp_dir, _source, mut registry) = setup(RegistryOptions::default());
        registry.add(temp_dir.path(), None).unwrap();

        let err = registry.add(temp_dir.path(), None).unwrap_err();
        assert!(matches!(
            err,
            WatchError::Registration {
                reason: RegistrationReason::AlreadyWatched,
                ..
            }
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_rejects_missing_and_files() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());

        let err = registry.add(temp_dir.path().join("nope"), None).unwrap_err();
        assert!(err.is_vanished());

        let file = temp_dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        let err = registry.add(&file, None).unwrap_err();
        assert!(matches!(
            err,
            WatchError::Registration {
                reason: RegistrationReason::NotADirectory,
                ..
            }
        ));

        assert!(registry.is_empty());
        assert_eq!(source.registered_count(), 0);
    }

    #[test]
    fn test_add_surfaces_source_rejection() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());
        let locked = temp_dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        source.deny(&locked, RegistrationReason::PermissionDenied);

        let err = registry.add(&locked, None).unwrap_err();
        assert!(matches!(
            err,
            WatchError::Registration {
                reason: RegistrationReason::PermissionDenied,
                ..
            }
        ));
        assert!(!registry.contains(&locked));
    }

    #[test]
    fn test_remove_twice() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());
        let dir = temp_dir.path().join("a");
        fs::create_dir(&dir).unwrap();
        registry.add(&dir, None).unwrap();

        registry.remove(&dir).unwrap();
        let err = registry.remove(&dir).unwrap_err();
        assert!(matches!(err, WatchError::NotFound { .. }));
        assert_eq!(source.released_count(), 1);
        assert!(registry.lookup(&dir).is_none());
    }

    #[test]
    fn test_remove_after_directory_is_gone() {
        let (temp_dir, _source, mut registry) = setup(RegistryOptions::default());
        let dir = temp_dir.path().join("a");
        fs::create_dir(&dir).unwrap();
        registry.add(&dir, None).unwrap();

        fs::remove_dir(&dir).unwrap();
        assert!(registry.remove(&dir).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_subtree() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());
        let root = normalize_path(temp_dir.path());
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("a-b")).unwrap();
        registry.populate_recursive(&root).unwrap();
        assert_eq!(registry.len(), 4);

        let removed = registry.remove_subtree(root.join("a"));
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.list(), vec![root.clone(), root.join("a-b")]);
        assert_eq!(source.released_count(), 2);

        assert!(registry.remove_subtree(root.join("a")).is_empty());
    }

    #[test]
    fn test_populate_registers_whole_tree() {
        let (temp_dir, _source, mut registry) = setup(RegistryOptions::default());
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("d")).unwrap();
        fs::write(root.join("a/file.txt"), "x").unwrap();

        let report = registry.populate_recursive(root).unwrap();
        assert_eq!(report.registered, 5);
        assert!(report.failures.is_empty());

        let root = normalize_path(root);
        let expected: Vec<PathBuf> = vec![
            root.clone(),
            root.join("a"),
            root.join("a/b"),
            root.join("a/b/c"),
            root.join("d"),
        ];
        assert_eq!(registry.list(), expected);
        assert!(registry.descriptors().all(Descriptor::is_active));
    }

    #[test]
    fn test_populate_skips_known_directories() {
        let (temp_dir, _source, mut registry) = setup(RegistryOptions::default());
        fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        registry.populate_recursive(temp_dir.path()).unwrap();

        let report = registry.populate_recursive(temp_dir.path()).unwrap();
        assert_eq!(report.registered, 0);
        assert_eq!(report.skipped, 3);
    }

    #[test]
    fn test_populate_continues_past_failed_sibling() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());
        let root = temp_dir.path();
        fs::create_dir_all(root.join("bad/inner")).unwrap();
        fs::create_dir_all(root.join("good")).unwrap();
        source.deny(&root.join("bad"), RegistrationReason::LimitReached);

        let report = registry.populate_recursive(root).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(registry.contains(root.join("good")));
        assert!(!registry.contains(root.join("bad")));
        // no descent below a directory that failed
        assert!(!registry.contains(root.join("bad/inner")));
    }

    #[test]
    fn test_populate_root_failure_is_fatal() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());
        source.deny(temp_dir.path(), RegistrationReason::PermissionDenied);

        assert!(registry.populate_recursive(temp_dir.path()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_flag_resolution() {
        let options = RegistryOptions {
            flags: EventMask::MODIFY,
            recursive: false,
            use_watcher_flags: false,
        };
        let (temp_dir, _source, mut registry) = setup(options);
        let dir = temp_dir.path().join("a");
        fs::create_dir(&dir).unwrap();

        let root = registry.add(temp_dir.path(), None).unwrap();
        assert_eq!(root.flags(), EventMask::MODIFY | EventMask::SELF_EVENTS);

        let child = registry.add(&dir, Some(EventMask::CREATE)).unwrap();
        assert_eq!(child.flags(), EventMask::CREATE);
    }

    #[test]
    fn test_watcher_flags_override_per_call_flags() {
        let options = RegistryOptions {
            flags: EventMask::MODIFY,
            recursive: true,
            use_watcher_flags: true,
        };
        let (temp_dir, _source, mut registry) = setup(options);
        let dir = temp_dir.path().join("a");
        fs::create_dir(&dir).unwrap();

        let child = registry.add(&dir, Some(EventMask::ATTRIB)).unwrap();
        assert_eq!(child.flags(), EventMask::MODIFY | EventMask::STRUCTURAL);
    }

    #[test]
    fn test_lookup_by_handle_and_clear() {
        let (temp_dir, source, mut registry) = setup(RegistryOptions::default());
        fs::create_dir_all(temp_dir.path().join("a")).unwrap();
        registry.populate_recursive(temp_dir.path()).unwrap();

        let handle = registry.lookup(temp_dir.path()).unwrap().handle();
        assert_eq!(
            registry.lookup_handle(handle).unwrap().path(),
            normalize_path(temp_dir.path())
        );

        assert_eq!(registry.clear(), 2);
        assert!(registry.lookup_handle(handle).is_none());
        assert_eq!(source.registered_count(), 0);
    }

    #[test]
    fn test_start_stop_all() {
        let (temp_dir, _source, mut registry) = setup(RegistryOptions::default());
        fs::create_dir_all(temp_dir.path().join("a")).unwrap();
        registry.populate_recursive(temp_dir.path()).unwrap();

        assert_eq!(registry.stop_all(), 2);
        assert_eq!(registry.stop_all(), 0);
        assert_eq!(registry.start_all(), 2);
        assert!(registry.stop(temp_dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_normalize_path_lexical() {
        assert_eq!(
            normalize_path(Path::new("/does/not/./exist/../really/")),
            PathBuf::from("/does/not/really")
        );
    }
}
