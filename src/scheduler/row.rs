use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

/// One annotatable unit of work, identified by the data source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(pub String);

/// One data facet of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Column(pub String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(Row);
string_id!(Column);

/// Result of asking for the next row for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Assigned(Row),
    /// Every row in the probed window was already seen by the worker.
    Exhausted,
}

impl Selection {
    pub fn row(&self) -> Option<&Row> {
        match self {
            Selection::Assigned(row) => Some(row),
            Selection::Exhausted => None,
        }
    }
}
