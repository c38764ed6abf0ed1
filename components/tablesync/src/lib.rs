/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! Bidirectional row-level synchronization for SQLite databases.
//!
//! A [`SyncProvider`] attaches to an existing database, installs a sidecar
//! change-log maintained by triggers on the configured tables, and exposes
//! three operations: extract everything ([`SyncProvider::get_initial_set`]),
//! extract what changed since an anchor
//! ([`SyncProvider::get_incremental_changes`]) and replay a change set from
//! another store, detecting conflicts along the way
//! ([`SyncProvider::apply_changes`]).
//!
//! Moving change sets between processes is the caller's concern; they are
//! plain serde values.

mod config;
pub mod error;
mod provider;
mod schema;
mod templates;
mod types;
mod values;

pub use crate::config::{ColumnKind, RecordSchema, SyncConfiguration, SyncDirection, SyncTable};
pub use crate::error::{Error, Result};
pub use crate::provider::SyncProvider;
pub use crate::types::{
    Anchor, ChangeItem, ChangeSet, ChangeType, ConflictResolution, ConflictResolver, JsonMap,
};

// Re-exported so callers can hold a cancellation handle without importing
// the support crate.
pub use interrupt_support::{InterruptHandle, Interruptee};
