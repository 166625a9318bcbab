//! Recursive directory watching.
//!
//! A [`WatchManager`] keeps one watch per directory of a tree, follows the
//! tree as directories appear and disappear, and publishes classified events
//! to the consumer.
//!
//! # Architecture
//!
//! ```text
//! NotificationSource (notify or in-memory)
//!   - one registration per directory, opaque handles
//!   - pushes RawRecords through a RecordSink
//!         |
//!   WatchManager reconcile loop
//!   - Classifier: raw bits -> EventKind
//!   - DescriptorRegistry: add/start on DirCreated, remove on DirRemoved
//!         |
//!    +---------+
//!    |         |
//! events()  errors()
//! ```

mod classifier;
mod descriptor;
mod error;
mod manager;
mod mask;
pub mod memory;
mod notify_source;
mod registry;
mod source;

pub use classifier::{ClassifiedEvent, Classifier, EventKind};
pub use descriptor::{Descriptor, WatchHandle};
pub use error::{RegistrationReason, SourceError, WatchError, WatchResult};
pub use manager::{ManagerState, WatchManager, WatchManagerBuilder};
pub use mask::EventMask;
pub use memory::MemorySource;
pub use notify_source::NotifySource;
pub use registry::{DescriptorRegistry, PopulateReport, RegistryOptions, normalize_path};
pub use source::{
    Attribution, HandleTable, NotificationSource, RawRecord, RecordSink, SourceMessage,
};
