//! Local filesystem side of a backup: layout, atomic writes and locking.

pub mod atomic;
pub mod layout;
pub mod lock;

pub use layout::{LocalLayout, LocalNames, RenameIndex};
pub use lock::DestinationLock;
