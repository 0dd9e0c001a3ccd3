use std::fmt;

use serde::{Deserialize, Serialize};

/// Composite identity of a catalog entry: `(scope, name)`.
///
/// Both components are opaque, case-sensitive strings; together they are
/// globally unique in the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub scope: String,
    pub name: String,
}

impl EntryKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}
