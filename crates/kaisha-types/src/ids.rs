//! Typed identifiers for companies and local operations.
//!
//! `CompanyId` wraps the server's integer id. Ids `>= 0` come from the server;
//! negative ids are placeholders the client hands out for adds that are still
//! in flight, so a placeholder can never collide with a real entity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A company identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(i64);

impl CompanyId {
    /// Wrap a raw id as received from the server.
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The `n`th placeholder (`n >= 1` maps to `-n`).
    pub const fn placeholder(n: u64) -> Self {
        Self(-(n as i64))
    }

    /// The raw integer.
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// True for client-side placeholders of in-flight adds.
    pub const fn is_placeholder(&self) -> bool {
        self.0 < 0
    }
}

impl From<i64> for CompanyId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<CompanyId> for i64 {
    fn from(id: CompanyId) -> i64 {
        id.0
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_placeholder() {
            write!(f, "CompanyId(placeholder {})", -self.0)
        } else {
            write!(f, "CompanyId({})", self.0)
        }
    }
}

/// Identifies one local mutation for the lifetime of a session.
///
/// Monotonic: later requests always get larger ids.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The id after this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}
