//! Notification source backed by `notify::RecommendedWatcher`.
//!
//! Every directory gets its own non-recursive watch, so the watcher decides
//! which parts of the tree are observed. notify's event thread acts as the
//! record pump: it translates each `notify::Event` into raw records and
//! pushes them into the sink without waiting on the reconcile loop.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use super::descriptor::WatchHandle;
use super::error::{RegistrationReason, SourceError, WatchResult};
use super::mask::EventMask;
use super::registry::io_reason;
use super::source::{HandleTable, NotificationSource, RawRecord, RecordSink};

/// ENOSPC from inotify_add_watch: the per-user watch limit is exhausted.
const ENOSPC: i32 = 28;

pub struct NotifySource {
    /// `None` once closed.
    watcher: Mutex<Option<RecommendedWatcher>>,
    table: Arc<RwLock<HandleTable>>,
}

impl NotifySource {
    pub fn new(sink: RecordSink) -> WatchResult<Self> {
        let table = Arc::new(RwLock::new(HandleTable::new()));
        let pump_table = Arc::clone(&table);
        let mut echoes = EchoFilter::default();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event.need_rescan() {
                    sink.error(SourceError::Overflow);
                }
                let records = records_from_event(&pump_table.read(), &mut echoes, &event);
                for record in records {
                    if !sink.record(record) {
                        return;
                    }
                }
            }
            Err(e) => {
                sink.error(source_error(e));
            }
        })?;

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            table,
        })
    }
}

impl NotificationSource for NotifySource {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn register(&self, path: &Path, mask: EventMask) -> Result<WatchHandle, RegistrationReason> {
        let mut guard = self.watcher.lock();
        let watcher = guard
            .as_mut()
            .ok_or_else(|| RegistrationReason::Rejected("source closed".to_string()))?;

        // The table lock must not be held across `watch`: notify's event
        // thread takes it while the watch request is being served.
        let handle = self.table.write().insert(path, mask);
        if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
            self.table.write().remove(handle);
            return Err(registration_reason(e));
        }

        crate::debug_event!("notify", "watching", "{} ({handle})", path.display());
        Ok(handle)
    }

    fn unregister(&self, handle: WatchHandle) -> Result<(), SourceError> {
        let path = self
            .table
            .write()
            .remove(handle)
            .ok_or(SourceError::UnknownHandle(handle))?;

        let mut guard = self.watcher.lock();
        let watcher = guard.as_mut().ok_or(SourceError::Closed)?;
        match watcher.unwatch(&path) {
            Ok(()) => Ok(()),
            // inotify drops the watch on its own once the directory is deleted
            Err(notify::Error {
                kind: notify::ErrorKind::WatchNotFound,
                ..
            }) => Err(SourceError::UnknownHandle(handle)),
            Err(e) => Err(source_error(e)),
        }
    }

    fn close(&self) {
        if self.watcher.lock().take().is_some() {
            self.table.write().clear();
            crate::debug_event!("notify", "closed");
        }
    }
}

/// Drops the second report of a change to a watched subdirectory.
///
/// A subdirectory is watched twice: through its parent and through its own
/// watch. inotify reports its removal, rename and attribute changes on both,
/// and notify does not say which watch an event came from.
#[derive(Debug, Default)]
pub(crate) struct EchoFilter {
    /// Subdirectories whose removal has been reported once.
    gone: HashSet<PathBuf>,
    /// Last non-structural record about a watched subdirectory.
    last: Option<(PathBuf, EventMask)>,
}

impl EchoFilter {
    /// Whether `record` should be delivered.
    pub(crate) fn admit(&mut self, table: &HandleTable, record: &RawRecord) -> bool {
        let path = &record.path;
        let watched_twice = record.is_dir
            && table.is_watched(path)
            && path.parent().is_some_and(|parent| table.is_watched(parent));

        if record.mask.intersects(EventMask::CREATED) {
            self.gone.remove(path);
        }

        if record.mask.intersects(EventMask::REMOVED) {
            self.last = None;
            // the own watch may report after the registry released it
            if self.gone.remove(path) {
                return false;
            }
            if watched_twice {
                self.gone.insert(path.clone());
            }
            return true;
        }

        if !watched_twice {
            self.last = None;
            return true;
        }
        let key = (path.clone(), record.mask);
        if self.last.as_ref() == Some(&key) {
            self.last = None;
            return false;
        }
        self.last = Some(key);
        true
    }
}

/// Translate one notify event into raw records for the registered watches.
pub(crate) fn records_from_event(
    table: &HandleTable,
    echoes: &mut EchoFilter,
    event: &Event,
) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let mut push = |path: &PathBuf, bits: EventMask, is_dir: bool| {
        if let Some(record) = table
            .admit(path, bits, is_dir)
            .filter(|record| echoes.admit(table, record))
        {
            records.push(record);
        }
    };

    match &event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => path.is_dir(),
                };
                push(path, EventMask::CREATE, is_dir);
            }
        }
        EventKind::Remove(kind) => {
            for path in &event.paths {
                let is_dir = match kind {
                    RemoveKind::Folder => true,
                    RemoveKind::File => false,
                    _ => table.is_watched(path),
                };
                push(path, EventMask::DELETE, is_dir);
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            // notify delivers the From and To halves on their own as well
            (RenameMode::Both, _) => {}
            (RenameMode::From, paths) => {
                for path in paths {
                    push(path, EventMask::MOVED_FROM, table.is_watched(path));
                }
            }
            (RenameMode::To, paths) => {
                for path in paths {
                    push(path, EventMask::MOVED_TO, path.is_dir());
                }
            }
            (_, paths) => {
                for path in paths {
                    if path.exists() {
                        push(path, EventMask::MOVED_TO, path.is_dir());
                    } else {
                        push(path, EventMask::MOVED_FROM, table.is_watched(path));
                    }
                }
            }
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            for path in &event.paths {
                push(path, EventMask::ATTRIB, path.is_dir());
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                push(path, EventMask::MODIFY, path.is_dir());
            }
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            for path in &event.paths {
                push(path, EventMask::CLOSE_WRITE, false);
            }
        }
        _ => {}
    }

    records
}

fn registration_reason(e: notify::Error) -> RegistrationReason {
    match e.kind {
        notify::ErrorKind::PathNotFound => RegistrationReason::Missing,
        notify::ErrorKind::MaxFilesWatch => RegistrationReason::LimitReached,
        notify::ErrorKind::Io(io) if io.raw_os_error() == Some(ENOSPC) => {
            RegistrationReason::LimitReached
        }
        notify::ErrorKind::Io(io) => io_reason(io),
        notify::ErrorKind::Generic(reason) => RegistrationReason::Rejected(reason),
        other => RegistrationReason::Rejected(format!("{other:?}")),
    }
}

fn source_error(e: notify::Error) -> SourceError {
    match e.kind {
        notify::ErrorKind::Io(io) => SourceError::Io(io.to_string()),
        notify::ErrorKind::Generic(reason) => SourceError::Backend(reason),
        other => SourceError::Backend(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::source::SourceMessage;
    use std::fs;
    use tempfile::TempDir;

    fn table() -> (HandleTable, WatchHandle) {
        let mut table = HandleTable::new();
        let root = table.insert(Path::new("/w"), EventMask::all());
        table.insert(Path::new("/w/sub"), EventMask::all());
        (table, root)
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, p| event.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_create_folder() {
        let (table, root) = table();
        let records = records_from_event(
            &table,
            &mut EchoFilter::default(),
            &event(EventKind::Create(CreateKind::Folder), &["/w/new"]),
        );
        assert_eq!(
            records,
            vec![RawRecord::new(Some(root), "/w/new", EventMask::CREATE, true)]
        );
    }

    #[test]
    fn test_remove_of_watched_child_is_a_directory() {
        let (table, root) = table();
        let records = records_from_event(
            &table,
            &mut EchoFilter::default(),
            &event(EventKind::Remove(RemoveKind::Any), &["/w/sub"]),
        );
        assert_eq!(
            records,
            vec![RawRecord::new(Some(root), "/w/sub", EventMask::DELETE, true)]
        );
    }

    #[test]
    fn test_root_removal_becomes_self_event() {
        let (table, root) = table();
        let records = records_from_event(
            &table,
            &mut EchoFilter::default(),
            &event(EventKind::Remove(RemoveKind::Folder), &["/w"]),
        );
        assert_eq!(
            records,
            vec![RawRecord::new(Some(root), "/w", EventMask::DELETE_SELF, true)]
        );
    }

    #[test]
    fn test_rename_from() {
        let (table, _) = table();
        let records = records_from_event(
            &table,
            &mut EchoFilter::default(),
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/w/sub"],
            ),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mask, EventMask::MOVED_FROM);
        assert!(records[0].is_dir);
    }

    #[test]
    fn test_close_write_and_unwatched_paths() {
        let (table, _) = table();
        let records = records_from_event(
            &table,
            &mut EchoFilter::default(),
            &event(
                EventKind::Access(AccessKind::Close(AccessMode::Write)),
                &["/w/sub/file.txt", "/elsewhere/file.txt"],
            ),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mask, EventMask::CLOSE_WRITE);
        assert_eq!(records[0].name, "file.txt");
    }

    #[test]
    fn test_access_open_is_ignored() {
        let (table, _) = table();
        let records = records_from_event(
            &table,
            &mut EchoFilter::default(),
            &event(EventKind::Access(AccessKind::Read), &["/w/file.txt"]),
        );
        assert!(records.is_empty());
    }

    /// Feed events through one filter, the way the pump does.
    fn replay(table: &HandleTable, events: &[Event]) -> Vec<(PathBuf, EventMask)> {
        let mut echoes = EchoFilter::default();
        events
            .iter()
            .flat_map(|e| records_from_event(table, &mut echoes, e))
            .map(|r| (r.path, r.mask))
            .collect()
    }

    #[test]
    fn test_subdirectory_removal_reported_once() {
        let (table, _) = table();
        let remove = event(EventKind::Remove(RemoveKind::Folder), &["/w/sub"]);
        assert_eq!(
            replay(&table, &[remove.clone(), remove]),
            vec![(PathBuf::from("/w/sub"), EventMask::DELETE)]
        );
    }

    #[test]
    fn test_subdirectory_rename_reported_once() {
        let (table, _) = table();
        let name = |mode| EventKind::Modify(ModifyKind::Name(mode));
        let records = replay(
            &table,
            &[
                event(name(RenameMode::From), &["/w/sub"]),
                event(name(RenameMode::To), &["/w/moved"]),
                event(name(RenameMode::Both), &["/w/sub", "/w/moved"]),
                // the directory's own watch
                event(name(RenameMode::From), &["/w/sub"]),
            ],
        );
        assert_eq!(
            records,
            vec![
                (PathBuf::from("/w/sub"), EventMask::MOVED_FROM),
                (PathBuf::from("/w/moved"), EventMask::MOVED_TO),
            ]
        );
    }

    #[test]
    fn test_recreated_subdirectory_can_be_removed_again() {
        let (table, _) = table();
        let remove = event(EventKind::Remove(RemoveKind::Folder), &["/w/sub"]);
        let create = event(EventKind::Create(CreateKind::Folder), &["/w/sub"]);
        let records = replay(&table, &[remove.clone(), create, remove]);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_subdirectory_attribute_change_reported_once() {
        let (table, _) = table();
        let chmod = event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
            &["/w/sub"],
        );
        // two changes, each reported by parent and own watch
        let records = replay(&table, &[chmod.clone(), chmod.clone(), chmod.clone(), chmod]);
        assert_eq!(
            records,
            vec![
                (PathBuf::from("/w/sub"), EventMask::ATTRIB),
                (PathBuf::from("/w/sub"), EventMask::ATTRIB),
            ]
        );
    }

    #[test]
    fn test_root_attribute_changes_are_not_collapsed() {
        let (table, _) = table();
        let chmod = event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
            &["/w"],
        );
        assert_eq!(replay(&table, &[chmod.clone(), chmod]).len(), 2);
    }

    #[test]
    fn test_register_and_unregister_real_directory() {
        let temp_dir = TempDir::new().unwrap();
        let (sink, _rx) = RecordSink::channel();
        let source = NotifySource::new(sink).unwrap();

        let handle = source.register(temp_dir.path(), EventMask::all()).unwrap();
        assert!(source.unregister(handle).is_ok());
        assert_eq!(
            source.unregister(handle),
            Err(SourceError::UnknownHandle(handle))
        );
    }

    #[test]
    fn test_register_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let (sink, _rx) = RecordSink::channel();
        let source = NotifySource::new(sink).unwrap();

        let reason = source
            .register(&temp_dir.path().join("missing"), EventMask::all())
            .unwrap_err();
        assert_eq!(reason, RegistrationReason::Missing);
    }

    #[test]
    fn test_pump_delivers_created_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        let (sink, rx) = RecordSink::channel();
        let source = NotifySource::new(sink).unwrap();
        source.register(&root, EventMask::all()).unwrap();

        fs::create_dir(root.join("a")).unwrap();

        let deadline = std::time::Duration::from_secs(5);
        let found = std::iter::from_fn(|| rx.recv_timeout(deadline).ok()).any(|msg| {
            matches!(
                msg,
                SourceMessage::Record(ref r)
                    if r.path == root.join("a") && r.is_dir && r.mask.contains(EventMask::CREATE)
            )
        });
        assert!(found, "expected a CREATE record for the new directory");

        source.close();
        assert!(source.register(&root, EventMask::all()).is_err());
    }
}
