//! In-process notification source.
//!
//! Records are injected by the embedding program instead of coming from the
//! operating system: useful for replaying captured streams, for driving a
//! watcher from another event system, and for deterministic tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::descriptor::WatchHandle;
use super::error::{RegistrationReason, SourceError};
use super::mask::EventMask;
use super::registry::normalize_path;
use super::source::{HandleTable, NotificationSource, RawRecord, RecordSink};

/// A source whose records are pushed by hand.
///
/// Cloning yields another handle to the same source.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

struct Inner {
    sink: RecordSink,
    table: Mutex<HandleTable>,
    denied: Mutex<HashMap<PathBuf, RegistrationReason>>,
    released: AtomicUsize,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new(sink: RecordSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                table: Mutex::new(HandleTable::new()),
                denied: Mutex::new(HashMap::new()),
                released: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Make future registrations of `path` fail with `reason`.
    pub fn deny(&self, path: impl AsRef<Path>, reason: RegistrationReason) {
        self.inner
            .denied
            .lock()
            .insert(normalize_path(path.as_ref()), reason);
    }

    /// Report a change the way a watching backend would: attributed to the
    /// registration covering `path` and filtered by its mask.
    ///
    /// Returns false when no registration covers the change or the record
    /// could not be delivered.
    pub fn emit(&self, path: impl AsRef<Path>, bits: EventMask, is_dir: bool) -> bool {
        if self.is_closed() {
            return false;
        }
        let record = self.inner.table.lock().admit(path.as_ref(), bits, is_dir);
        match record {
            Some(record) => self.inner.sink.record(record),
            None => false,
        }
    }

    /// Deliver a record verbatim.
    pub fn emit_raw(&self, record: RawRecord) -> bool {
        !self.is_closed() && self.inner.sink.record(record)
    }

    /// Report a source-level failure.
    pub fn fail(&self, error: SourceError) -> bool {
        self.inner.sink.error(error)
    }

    /// Number of live registrations.
    pub fn registered_count(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Number of successful unregistrations so far.
    pub fn released_count(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn is_watched(&self, path: impl AsRef<Path>) -> bool {
        self.inner.table.lock().is_watched(path.as_ref())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl NotificationSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn register(&self, path: &Path, mask: EventMask) -> Result<WatchHandle, RegistrationReason> {
        if self.is_closed() {
            return Err(RegistrationReason::Rejected("source closed".to_string()));
        }
        if let Some(reason) = self.inner.denied.lock().get(path) {
            return Err(reason.clone());
        }
        Ok(self.inner.table.lock().insert(path, mask))
    }

    fn unregister(&self, handle: WatchHandle) -> Result<(), SourceError> {
        self.inner
            .table
            .lock()
            .remove(handle)
            .ok_or(SourceError::UnknownHandle(handle))?;
        self.inner.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.table.lock().clear();
    }
}
