//! uprox Artifact System
//!
//! Content-addressed contract implementations and their storage layouts.
//!
//! # Core Concepts
//!
//! - [`Implementation`]: immutable compiled contract, identified by the hash
//!   of its bytecode and declared storage layout
//! - [`ContentHash`]: 32-byte Blake3 hash for content addressing
//! - [`Address`]: 20-byte ledger address
//! - [`LayoutAnalyzer`]: turns compiler layout metadata into a [`StorageSchema`]
//! - [`TypeTag`]: structural type of a state variable
//!
//! # Example
//!
//! ```rust,ignore
//! use uprox_artifact::{Implementation, LayoutAnalyzer};
//!
//! let implementation = Implementation::from_file("build/Box.json")?;
//! let schema = LayoutAnalyzer::new().analyze(&implementation)?;
//! println!("{} occupies {} slots", implementation.name(), schema.slots_used());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod address;
mod artifact;
mod hash;
mod layout;
mod types;

pub use address::{Address, Selector};
pub use artifact::{ArtifactError, ContractSource, Implementation};
pub use hash::{ContentHash, HashError};
pub use layout::{
    LayoutAnalyzer, LayoutBuilder, LayoutError, RawStorageItem, RawStorageLayout, RawTypeInfo,
    SlotEntry, StorageSchema, SLOT_BYTES,
};
pub use types::TypeTag;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
