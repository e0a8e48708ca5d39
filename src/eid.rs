use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};

/// Sortable unique id (ULID text) for search jobs and upload file names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct Eid(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid id '{0}': {1}")]
pub struct InvalidEid(String, String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accepts only well-formed ULIDs, so ids coming from callers can be
/// rejected before any lookup.
impl FromStr for Eid {
    type Err = InvalidEid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        rusty_ulid::Ulid::from_str(s)
            .map(|ulid| Eid(ulid.to_string()))
            .map_err(|e| InvalidEid(s.to_string(), e.to_string()))
    }
}

impl Deref for Eid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(rusty_ulid::generate_ulid_string())
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}
