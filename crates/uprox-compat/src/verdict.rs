//! Compatibility verdicts and the violations they carry

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use uprox_artifact::TypeTag;

/// Outcome of comparing two storage schemas
///
/// `safe` is true iff `violations` is empty; the constructor keeps the two
/// in agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityVerdict {
    /// Whether the upgrade preserves every existing slot
    pub safe: bool,
    /// Violations in old-schema order
    pub violations: Vec<SchemaViolation>,
}

impl CompatibilityVerdict {
    /// Verdict for a set of violations
    #[must_use]
    pub fn from_violations(violations: Vec<SchemaViolation>) -> Self {
        Self {
            safe: violations.is_empty(),
            violations,
        }
    }

    /// Whether the upgrade may proceed
    #[inline]
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.safe
    }

    /// Violation reported for an old-schema entry, if any
    #[must_use]
    pub fn violation_at(&self, index: usize) -> Option<&SchemaViolation> {
        self.violations.iter().find(|v| v.index == index)
    }
}

/// One existing slot entry the new schema does not preserve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// Position of the entry in the old schema
    pub index: usize,
    /// Slot of the entry in the old schema
    pub slot: u64,
    /// Byte offset of the entry in the old schema
    pub offset: u32,
    /// Variable name in the old schema
    pub name: String,
    /// What changed
    pub kind: ViolationKind,
}

impl Display for SchemaViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {} (offset {}) `{}`: {}",
            self.slot, self.offset, self.name, self.kind
        )
    }
}

/// Kind of incompatibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    /// Same position, different type
    TypeChanged { from: TypeTag, to: TypeTag },
    /// Same type, different storage footprint
    WidthChanged { from: u32, to: u32 },
    /// Entry no longer exists
    Removed,
    /// Entry moved to another position in the new schema
    Reordered { to: usize },
    /// Same type and position under a different name
    Renamed { to: String },
    /// Same type, but an earlier change moved it to another slot
    Shifted { slot: u64, offset: u32 },
}

impl Display for ViolationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeChanged { from, to } => write!(f, "type changed from {from} to {to}"),
            Self::WidthChanged { from, to } => {
                write!(f, "width changed from {from} to {to} bytes")
            }
            Self::Removed => f.write_str("removed"),
            Self::Reordered { to } => write!(f, "moved to position {to}"),
            Self::Renamed { to } => write!(f, "renamed to `{to}`"),
            Self::Shifted { slot, offset } => {
                write!(f, "shifted to slot {slot} (offset {offset})")
            }
        }
    }
}
