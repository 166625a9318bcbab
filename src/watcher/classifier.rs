//! Turns raw records into named events.
//!
//! Every predicate is evaluated on its own; one record can yield several
//! events (a rename into a directory that also touched its contents, for
//! instance). Records that match nothing are dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::mask::EventMask;
use super::source::RawRecord;

/// Semantic kind of a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DirCreated,
    DirRemoved,
    DirChanged,
    FileCreated,
    FileRemoved,
    FileChanged,
    RootDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::DirCreated,
        EventKind::DirRemoved,
        EventKind::DirChanged,
        EventKind::FileCreated,
        EventKind::FileRemoved,
        EventKind::FileChanged,
        EventKind::RootDeleted,
    ];

    /// Raw bits that signal this kind.
    pub fn mask(self) -> EventMask {
        match self {
            EventKind::DirCreated | EventKind::FileCreated => EventMask::CREATED,
            EventKind::DirRemoved | EventKind::FileRemoved => EventMask::REMOVED,
            EventKind::DirChanged => EventMask::DIR_CHANGED,
            EventKind::FileChanged => EventMask::FILE_CHANGED,
            EventKind::RootDeleted => EventMask::SELF_EVENTS,
        }
    }

    /// Whether the kind concerns a directory. The root counts as one.
    pub fn is_dir(self) -> bool {
        !matches!(
            self,
            EventKind::FileCreated | EventKind::FileRemoved | EventKind::FileChanged
        )
    }

    /// Union of the masks of `kinds`.
    pub fn mask_of(kinds: &[EventKind]) -> EventMask {
        kinds
            .iter()
            .fold(EventMask::empty(), |acc, kind| acc | kind.mask())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::DirCreated => "dir_created",
            EventKind::DirRemoved => "dir_removed",
            EventKind::DirChanged => "dir_changed",
            EventKind::FileCreated => "file_created",
            EventKind::FileRemoved => "file_removed",
            EventKind::FileChanged => "file_changed",
            EventKind::RootDeleted => "root_deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<_> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown event kind '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

/// A semantically typed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    pub kind: EventKind,
    pub path: PathBuf,
    pub name: String,
}

impl ClassifiedEvent {
    fn from_record(kind: EventKind, record: &RawRecord) -> Self {
        Self {
            kind,
            path: record.path.clone(),
            name: record.name.clone(),
        }
    }
}

impl fmt::Display for ClassifiedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path.display())
    }
}

/// Bits that mean "the root is gone" when carried by a record about the root.
const ROOT_LOSS: EventMask = EventMask::SELF_EVENTS.union(EventMask::REMOVED);

/// Classifier bound to one watch root.
#[derive(Debug, Clone)]
pub struct Classifier {
    root: PathBuf,
}

impl Classifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `record` reports the loss of the root itself.
    pub fn is_root_deletion(&self, record: &RawRecord) -> bool {
        record.path == self.root && record.mask.intersects(ROOT_LOSS)
    }

    /// Classify one record.
    ///
    /// Root deletion is checked first and, when it matches, is the only
    /// event returned.
    pub fn classify(&self, record: &RawRecord) -> Vec<ClassifiedEvent> {
        if self.is_root_deletion(record) {
            return vec![ClassifiedEvent::from_record(EventKind::RootDeleted, record)];
        }

        // Self bits of other directories match no predicate; their parent
        // reports the structural change.
        PREDICATES
            .iter()
            .filter(|predicate| predicate.matches(record))
            .map(|predicate| ClassifiedEvent::from_record(predicate.kind, record))
            .collect()
    }
}

struct Predicate {
    kind: EventKind,
    dir: bool,
}

impl Predicate {
    fn matches(&self, record: &RawRecord) -> bool {
        record.is_dir == self.dir && record.mask.intersects(self.kind.mask())
    }
}

const PREDICATES: [Predicate; 6] = [
    Predicate { kind: EventKind::DirCreated, dir: true },
    Predicate { kind: EventKind::DirRemoved, dir: true },
    Predicate { kind: EventKind::DirChanged, dir: true },
    Predicate { kind: EventKind::FileCreated, dir: false },
    Predicate { kind: EventKind::FileRemoved, dir: false },
    Predicate { kind: EventKind::FileChanged, dir: false },
];
