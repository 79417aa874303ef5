//! uprox Compatibility Checker
//!
//! Decides whether a new implementation's storage schema can safely replace
//! the one currently behind a proxy.
//!
//! # Example
//!
//! ```rust,ignore
//! use uprox_compat::CompatibilityChecker;
//!
//! let verdict = CompatibilityChecker::new().check(&old_schema, &new_schema);
//! for violation in &verdict.violations {
//!     eprintln!("{violation}");
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod checker;
mod verdict;

pub use checker::CompatibilityChecker;
pub use verdict::{CompatibilityVerdict, SchemaViolation, ViolationKind};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
