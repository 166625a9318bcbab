//! The seam between the watcher and whatever delivers raw change records.
//!
//! A source registers directories and pushes [`RawRecord`]s (or
//! [`SourceError`]s) into a [`RecordSink`] from its own delivery thread.
//! The sink feeds an unbounded queue, so a slow reconcile loop never stalls
//! the source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::descriptor::WatchHandle;
use super::error::{RegistrationReason, SourceError};
use super::mask::EventMask;

/// An unclassified change record as delivered by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Registration that reported the record, when the source tracks it.
    pub handle: Option<WatchHandle>,
    /// Absolute path of the entry the record concerns.
    pub path: PathBuf,
    /// Base name of `path`.
    pub name: String,
    pub mask: EventMask,
    pub is_dir: bool,
}

impl RawRecord {
    pub fn new(
        handle: Option<WatchHandle>,
        path: impl Into<PathBuf>,
        mask: EventMask,
        is_dir: bool,
    ) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            handle,
            path,
            name,
            mask,
            is_dir,
        }
    }
}

/// What travels through the internal record queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMessage {
    Record(RawRecord),
    Error(SourceError),
}

/// Producer half of the internal record queue.
#[derive(Debug, Clone)]
pub struct RecordSink {
    tx: Sender<SourceMessage>,
}

impl RecordSink {
    /// Create a sink and the queue it feeds.
    pub fn channel() -> (RecordSink, Receiver<SourceMessage>) {
        let (tx, rx) = unbounded();
        (RecordSink { tx }, rx)
    }

    /// Forward a record. Returns false once nobody is listening.
    pub fn record(&self, record: RawRecord) -> bool {
        self.tx.send(SourceMessage::Record(record)).is_ok()
    }

    /// Forward a source failure. Returns false once nobody is listening.
    pub fn error(&self, error: SourceError) -> bool {
        self.tx.send(SourceMessage::Error(error)).is_ok()
    }
}

/// A provider of raw change records for registered directories.
///
/// Registration is immediate: once `register` returns, the source may report
/// records for the directory. Whether they are acted upon is the watcher's
/// decision.
pub trait NotificationSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &'static str;

    /// Start reporting changes inside `path` whose bits intersect `mask`.
    fn register(&self, path: &Path, mask: EventMask) -> Result<WatchHandle, RegistrationReason>;

    /// Stop reporting changes for `handle`.
    fn unregister(&self, handle: WatchHandle) -> Result<(), SourceError>;

    /// Release every registration and stop delivering records.
    fn close(&self);
}

/// Where a record came from, as far as the handle table can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribution {
    pub handle: WatchHandle,
    pub mask: EventMask,
    /// The record concerns the watched directory itself rather than an entry in it.
    pub self_event: bool,
}

/// Source-side bookkeeping: watched path to handle and registered mask.
///
/// Backends without native handles use this to allocate them and to
/// attribute incoming paths to the registration that reported them.
#[derive(Debug, Default)]
pub struct HandleTable {
    next: u64,
    by_path: HashMap<PathBuf, (WatchHandle, EventMask)>,
    by_handle: HashMap<WatchHandle, PathBuf>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh handle for `path`, replacing any previous entry.
    pub fn insert(&mut self, path: &Path, mask: EventMask) -> WatchHandle {
        self.next += 1;
        let handle = WatchHandle::new(self.next);
        if let Some((old, _)) = self.by_path.insert(path.to_path_buf(), (handle, mask)) {
            self.by_handle.remove(&old);
        }
        self.by_handle.insert(handle, path.to_path_buf());
        handle
    }

    /// Forget `handle`, returning the path it was registered for.
    pub fn remove(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let path = self.by_handle.remove(&handle)?;
        self.by_path.remove(&path);
        Some(path)
    }

    pub fn path_of(&self, handle: WatchHandle) -> Option<&Path> {
        self.by_handle.get(&handle).map(PathBuf::as_path)
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_path.clear();
        self.by_handle.clear();
    }

    /// Find the registration responsible for a record about `path`.
    ///
    /// A watched parent reports changes to its entries. A watched path with
    /// no watched parent can only have been reported by its own watch.
    pub fn attribute(&self, path: &Path) -> Option<Attribution> {
        if let Some((handle, mask)) = path.parent().and_then(|p| self.by_path.get(p)) {
            return Some(Attribution {
                handle: *handle,
                mask: *mask,
                self_event: false,
            });
        }
        self.by_path.get(path).map(|(handle, mask)| Attribution {
            handle: *handle,
            mask: *mask,
            self_event: true,
        })
    }

    /// Turn raw bits about `path` into a record, or drop them.
    ///
    /// Self events are rewritten to their `*_SELF` form, and bits outside the
    /// registered mask are discarded the way a kernel backend would.
    pub fn admit(&self, path: &Path, bits: EventMask, is_dir: bool) -> Option<RawRecord> {
        let origin = self.attribute(path)?;
        let mut bits = bits;
        if origin.self_event {
            if bits.intersects(EventMask::DELETE) {
                bits.remove(EventMask::DELETE);
                bits.insert(EventMask::DELETE_SELF);
            }
            if bits.intersects(EventMask::MOVED_FROM) {
                bits.remove(EventMask::MOVED_FROM);
                bits.insert(EventMask::MOVE_SELF);
            }
        }
        let bits = bits & origin.mask;
        if bits.is_empty() {
            return None;
        }
        Some(RawRecord::new(Some(origin.handle), path, bits, is_dir))
    }
}
