/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use serde_derive::{Deserialize, Serialize};
use std::cmp::Ordering;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The provider-variant tag carried by every anchor this crate produces.
pub(crate) const SQLITE_PROVIDER: &str = "sqlite";

/// An opaque token naming a point in a store's change history.
///
/// Anchors produced by the same provider variant are totally ordered by
/// `version`; comparing anchors across variants is meaningless, which is why
/// `partial_cmp` returns `None` for them. Version 0 means "before anything".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub provider: String,
    pub version: u64,
}

impl Anchor {
    pub fn new(version: u64) -> Self {
        Self {
            provider: SQLITE_PROVIDER.to_string(),
            version,
        }
    }

    pub fn zero() -> Self {
        Self::new(0)
    }

    pub(crate) fn is_compatible(&self) -> bool {
        self.provider == SQLITE_PROVIDER
    }
}

impl PartialOrd for Anchor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.provider != other.provider {
            return None;
        }
        Some(self.version.cmp(&other.version))
    }
}

/// The kind of row-level mutation a change item carries.
///
/// The one-character codes are what the change-log stores; their alphabetical
/// order ('D' < 'I' < 'U') is what lets `MIN(OP)` collapse several log
/// entries for one row into the strongest surviving operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub(crate) fn op_code(self) -> &'static str {
        match self {
            ChangeType::Insert => "I",
            ChangeType::Update => "U",
            ChangeType::Delete => "D",
        }
    }

    pub(crate) fn from_op_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(ChangeType::Insert),
            "U" => Some(ChangeType::Update),
            "D" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// One row-level mutation. `table` is the qualified `schema.name` of the
/// source table; `values` maps column names to values, with NULL columns
/// present as JSON null.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeItem {
    pub table: String,
    pub change_type: ChangeType,
    pub values: JsonMap,
}

/// An anchor plus the ordered list of changes that lead up to it. The anchor
/// describes the producing store at the moment of extraction; a caller
/// re-tags it with the base version when handing the set to `apply_changes`
/// on another store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub anchor: Anchor,
    pub items: Vec<ChangeItem>,
}

impl ChangeSet {
    pub fn new(anchor: Anchor) -> Self {
        Self {
            anchor,
            items: Vec::new(),
        }
    }
}

/// What to do with an incoming update or delete whose target row has local
/// changes newer than the incoming base anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Leave the local row alone. The default when no resolver is supplied.
    Skip,
    /// Apply the incoming change regardless, bypassing the conflict check.
    ForceWrite,
}

/// Per-item conflict decision, invoked synchronously while the apply
/// transaction is open. The callback must not touch the store it is
/// resolving for.
pub trait ConflictResolver {
    fn resolve(&self, item: &ChangeItem) -> ConflictResolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&ChangeItem) -> ConflictResolution,
{
    fn resolve(&self, item: &ChangeItem) -> ConflictResolution {
        self(item)
    }
}
