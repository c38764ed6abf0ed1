/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::types::Anchor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The anchor was produced by a different provider variant and cannot
    /// be interpreted against this store.
    #[error("Incompatible anchor for provider '{0}'")]
    IncompatibleAnchor(String),

    /// The change history needed to serve the request has been pruned, or
    /// never existed on this store.
    #[error("Anchor version {0} predates the retained change history")]
    AnchorTooOld(u64),

    /// An incoming insert collides with an existing row. Carries the anchor
    /// the caller should re-sync from.
    #[error("A row with the incoming primary key already exists; re-sync from version {}", candidate_anchor.version)]
    InvalidSyncOperation { candidate_anchor: Anchor },

    #[error("The operation was interrupted")]
    Interrupted(#[from] interrupt_support::Interrupted),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
