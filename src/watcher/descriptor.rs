//! Watch descriptors: one per watched directory.

use std::fmt;
use std::path::{Path, PathBuf};

use super::mask::EventMask;

/// Opaque identifier a notification source hands out for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Binds a directory to its registration with the notification source.
///
/// A descriptor starts out pending: the source already knows about it, but
/// records reported through its handle are dropped until it is started.
/// Values handed out by the registry are snapshots; the handle itself is
/// released only when the registry removes the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    path: PathBuf,
    handle: WatchHandle,
    flags: EventMask,
    active: bool,
}

impl Descriptor {
    pub(crate) fn pending(path: PathBuf, handle: WatchHandle, flags: EventMask) -> Self {
        Self {
            path,
            handle,
            flags,
            active: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> WatchHandle {
        self.handle
    }

    pub fn flags(&self) -> EventMask {
        self.flags
    }

    /// Whether records for this directory are being forwarded.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns true if the state changed.
    pub(crate) fn start(&mut self) -> bool {
        !std::mem::replace(&mut self.active, true)
    }

    /// Returns true if the state changed.
    pub(crate) fn stop(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }
}
