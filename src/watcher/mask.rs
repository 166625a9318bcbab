//! Raw event bits and the per-kind masks the classifier matches against.
//!
//! Bit values follow the inotify layout so records coming from a kernel
//! backend can be carried without translation.

use bitflags::bitflags;

bitflags! {
    /// Raw change bits attached to a record, and the interest mask attached
    /// to a registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        /// Contents were written.
        const MODIFY = 0x0000_0002;
        /// Metadata changed (permissions, timestamps, ownership).
        const ATTRIB = 0x0000_0004;
        /// A file opened for writing was closed.
        const CLOSE_WRITE = 0x0000_0008;
        /// An entry was renamed away from the watched directory.
        const MOVED_FROM = 0x0000_0040;
        /// An entry was renamed into the watched directory.
        const MOVED_TO = 0x0000_0080;
        /// An entry was created in the watched directory.
        const CREATE = 0x0000_0100;
        /// An entry was deleted from the watched directory.
        const DELETE = 0x0000_0200;
        /// The watched directory itself was deleted.
        const DELETE_SELF = 0x0000_0400;
        /// The watched directory itself was moved.
        const MOVE_SELF = 0x0000_0800;
    }
}

impl EventMask {
    /// Bits reconciliation needs on every directory of a recursive watch.
    pub const STRUCTURAL: Self = Self::CREATE
        .union(Self::DELETE)
        .union(Self::MOVED_FROM)
        .union(Self::MOVED_TO);

    /// Bits signalling the loss of a watched directory itself.
    pub const SELF_EVENTS: Self = Self::DELETE_SELF.union(Self::MOVE_SELF);

    pub const CREATED: Self = Self::CREATE.union(Self::MOVED_TO);
    pub const REMOVED: Self = Self::DELETE.union(Self::MOVED_FROM);
    pub const DIR_CHANGED: Self = Self::MODIFY.union(Self::ATTRIB);
    pub const FILE_CHANGED: Self = Self::MODIFY
        .union(Self::ATTRIB)
        .union(Self::CLOSE_WRITE);
}
