//! Timeline encryption engine for Kinlog.
//!
//! A family keeps one General timeline and one timeline per child, each behind
//! its own password, all in one shared store. This crate:
//!
//! - seals entries in the current single-timeline format and still reads the
//!   legacy multi-recipient format ([`codec`], [`dispatch`])
//! - finds which timeline a password belongs to by trial decryption and loads
//!   it ([`discovery`])
//! - keeps the child roster and the parent's session passwords ([`roster`],
//!   [`session`])
//!
//! [`TimelineEngine`] is the entry point for most callers.
//!
//! # Errors
//!
//! A single entry that fails to open is an [`EntryError`] and never aborts a
//! batch. [`TimelineError`] is reserved for failures of a whole operation.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod dispatch;
mod engine;
pub mod entry;
mod error;
pub mod identity;
pub mod roster;
pub mod session;
pub mod store;
pub mod telemetry;

pub use config::{DiscoveryStrategy, EngineConfig};
pub use discovery::{
    DiscoveryOutcome, EntryAnomaly, TimelineDiscovery, TimelineLoad, TimelineMatch, UnlockOutcome,
};
pub use dispatch::{classify, open_entry, open_entry_as, EntryFormat, FormatKind, OpenedEntry};
pub use engine::TimelineEngine;
pub use entry::EntryRecord;
pub use error::{EntryError, StoreError, StoreResult, TimelineError, TimelineResult};
pub use identity::{ChildId, TimelineId, TimelineIdParseError};
pub use roster::{discovery_order, ChildProfile};
pub use session::{CredentialFailure, SessionPasswords};
pub use store::{EntryStore, MemoryStore, RosterStore};
