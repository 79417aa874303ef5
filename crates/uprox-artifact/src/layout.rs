//! Storage layout analysis
//!
//! Turns the compiler's storage layout metadata (the `storageLayout` section
//! of a contract artifact) into a [`StorageSchema`]: the flattened, ordered
//! list of state variables with their slot, offset, type and width.
//!
//! The schema is validated against the ledger's packing rules. Every entry
//! must sit exactly where the packer would have put it given the entries
//! before it, so a schema describes one and only one byte layout.

use crate::artifact::Implementation;
use crate::types::TypeTag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bytes per storage slot
pub const SLOT_BYTES: u32 = 32;

/// Errors raised while extracting a storage schema
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    /// Artifact carries no storage layout metadata
    #[error("artifact `{contract}` has no storage layout metadata")]
    MissingLayout { contract: String },

    /// Type identifier not present in the type table
    #[error("unknown storage type `{id}`")]
    UnknownType { id: String },

    /// Type identifier could not be parsed
    #[error("malformed type identifier `{id}`: {reason}")]
    MalformedTypeId { id: String, reason: String },

    /// Type nesting exceeds the supported depth
    #[error("type `{id}` nests too deeply")]
    TypeTooDeep { id: String },

    /// Declared width disagrees with the type
    #[error("`{name}` declares {found} bytes but its type needs {expected}")]
    WidthMismatch {
        name: String,
        expected: u32,
        found: u32,
    },

    /// Entry is not where the packing rules place it
    #[error(
        "`{name}` sits at slot {found_slot}+{found_offset}, packing places it at slot {expected_slot}+{expected_offset}"
    )]
    NonContiguous {
        name: String,
        expected_slot: u64,
        expected_offset: u32,
        found_slot: u64,
        found_offset: u32,
    },

    /// Width value out of range
    #[error("`{name}` has invalid width {width}")]
    InvalidWidth { name: String, width: u64 },
}

/// Compiler storage layout section, as emitted in artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStorageLayout {
    /// State variables in declaration order (inherited first)
    #[serde(default)]
    pub storage: Vec<RawStorageItem>,

    /// Type table keyed by type identifier
    #[serde(default)]
    pub types: BTreeMap<String, RawTypeInfo>,
}

/// One state variable (or struct member) in the compiler layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStorageItem {
    /// Variable name
    pub label: String,

    /// Slot index
    #[serde(with = "lenient_u64")]
    pub slot: u64,

    /// Byte offset within the slot
    #[serde(default)]
    pub offset: u32,

    /// Type identifier, e.g. `t_uint256`
    #[serde(rename = "type")]
    pub type_id: String,
}

impl RawStorageItem {
    /// Create a layout item
    #[must_use]
    pub fn new(label: &str, slot: u64, offset: u32, type_id: &str) -> Self {
        Self {
            label: label.to_string(),
            slot,
            offset,
            type_id: type_id.to_string(),
        }
    }
}

/// Type table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTypeInfo {
    /// Human-readable type label
    pub label: String,

    /// Storage footprint in bytes
    #[serde(rename = "numberOfBytes", with = "lenient_u64")]
    pub number_of_bytes: u64,

    /// Struct members, if this is a struct
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<RawStorageItem>>,
}

/// One resolved state variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotEntry {
    /// Slot index
    pub slot: u64,
    /// Byte offset within the slot
    pub offset: u32,
    /// Variable name
    pub name: String,
    /// Structural type
    pub type_tag: TypeTag,
    /// Storage footprint in bytes
    pub width: u32,
}

/// Ordered, packing-validated storage schema of an implementation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SlotEntry>", into = "Vec<SlotEntry>")]
pub struct StorageSchema {
    entries: Vec<SlotEntry>,
}

impl StorageSchema {
    /// Build a schema, checking the packing invariants
    ///
    /// # Errors
    /// Returns [`LayoutError::NonContiguous`] if an entry is not where the
    /// packer would place it, or a width error for impossible widths.
    pub fn new(entries: Vec<SlotEntry>) -> Result<Self, LayoutError> {
        let mut cursor = Cursor::default();
        for entry in &entries {
            check_width(&entry.name, &entry.type_tag, entry.width)?;
            let (slot, offset) = cursor.place(entry.width, entry.type_tag.is_slot_aligned());
            if (entry.slot, entry.offset) != (slot, offset) {
                return Err(LayoutError::NonContiguous {
                    name: entry.name.clone(),
                    expected_slot: slot,
                    expected_offset: offset,
                    found_slot: entry.slot,
                    found_offset: entry.offset,
                });
            }
            cursor = Cursor::after(slot, offset, entry.width, entry.type_tag.is_slot_aligned());
        }
        Ok(Self { entries })
    }

    /// Entries in declaration order
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[SlotEntry] {
        &self.entries
    }

    /// Entry at a position
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SlotEntry> {
        self.entries.get(index)
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check for an empty schema
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the entry with this name and type, if any
    #[must_use]
    pub fn position_of(&self, name: &str, type_tag: &TypeTag) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name && &e.type_tag == type_tag)
    }

    /// Number of slots the schema occupies
    #[must_use]
    pub fn slots_used(&self) -> u64 {
        self.entries.last().map_or(0, |last| {
            Cursor::after(
                last.slot,
                last.offset,
                last.width,
                last.type_tag.is_slot_aligned(),
            )
            .slots_touched()
        })
    }
}

impl TryFrom<Vec<SlotEntry>> for StorageSchema {
    type Error = LayoutError;

    fn try_from(entries: Vec<SlotEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<StorageSchema> for Vec<SlotEntry> {
    fn from(schema: StorageSchema) -> Self {
        schema.entries
    }
}

/// Extracts storage schemas from implementation artifacts
///
/// Pure and deterministic: the same artifact always yields the same schema,
/// so results may be cached by implementation identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutAnalyzer;

impl LayoutAnalyzer {
    /// Create analyzer
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Analyze an implementation's storage layout
    ///
    /// # Errors
    /// Returns [`LayoutError::MissingLayout`] when the artifact has no
    /// layout metadata, or any resolution/packing error.
    pub fn analyze(&self, implementation: &Implementation) -> Result<StorageSchema, LayoutError> {
        let raw = implementation
            .storage_layout()
            .ok_or_else(|| LayoutError::MissingLayout {
                contract: implementation.name().to_string(),
            })?;
        self.analyze_raw(raw)
    }

    /// Analyze a raw compiler layout section
    ///
    /// # Errors
    /// Returns any resolution or packing error
    pub fn analyze_raw(&self, raw: &RawStorageLayout) -> Result<StorageSchema, LayoutError> {
        let entries = raw
            .storage
            .iter()
            .map(|item| {
                let type_tag = TypeTag::parse_id(&item.type_id, &raw.types)?;
                let width = resolve_width(&item.label, &item.type_id, &type_tag, &raw.types)?;
                Ok(SlotEntry {
                    slot: item.slot,
                    offset: item.offset,
                    name: item.label.clone(),
                    type_tag,
                    width,
                })
            })
            .collect::<Result<Vec<_>, LayoutError>>()?;
        StorageSchema::new(entries)
    }
}

fn resolve_width(
    name: &str,
    type_id: &str,
    tag: &TypeTag,
    types: &BTreeMap<String, RawTypeInfo>,
) -> Result<u32, LayoutError> {
    match types.get(type_id) {
        Some(info) => u32::try_from(info.number_of_bytes).map_err(|_| LayoutError::InvalidWidth {
            name: name.to_string(),
            width: info.number_of_bytes,
        }),
        None => tag.natural_width().ok_or_else(|| LayoutError::UnknownType {
            id: type_id.to_string(),
        }),
    }
}

fn check_width(name: &str, tag: &TypeTag, width: u32) -> Result<(), LayoutError> {
    if width == 0 {
        return Err(LayoutError::InvalidWidth {
            name: name.to_string(),
            width: 0,
        });
    }
    match tag.natural_width() {
        Some(expected) if expected != width => Err(LayoutError::WidthMismatch {
            name: name.to_string(),
            expected,
            found: width,
        }),
        None if width % SLOT_BYTES != 0 => Err(LayoutError::WidthMismatch {
            name: name.to_string(),
            expected: width.div_ceil(SLOT_BYTES) * SLOT_BYTES,
            found: width,
        }),
        _ => Ok(()),
    }
}

/// Packing cursor: the next free byte position
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    slot: u64,
    offset: u32,
}

impl Cursor {
    /// Where the next entry of `width` bytes goes
    fn place(self, width: u32, aligned: bool) -> (u64, u32) {
        if aligned || width >= SLOT_BYTES {
            if self.offset == 0 {
                (self.slot, 0)
            } else {
                (self.slot.saturating_add(1), 0)
            }
        } else if self.offset + width > SLOT_BYTES {
            (self.slot.saturating_add(1), 0)
        } else {
            (self.slot, self.offset)
        }
    }

    /// Cursor after an entry placed at `slot`/`offset`
    fn after(slot: u64, offset: u32, width: u32, aligned: bool) -> Self {
        if aligned || width >= SLOT_BYTES {
            Self {
                slot: slot.saturating_add(u64::from(width.div_ceil(SLOT_BYTES))),
                offset: 0,
            }
        } else {
            Self {
                slot,
                offset: offset + width,
            }
        }
    }

    fn slots_touched(self) -> u64 {
        if self.offset == 0 {
            self.slot
        } else {
            self.slot.saturating_add(1)
        }
    }
}

/// Programmatic construction of compiler layout sections
///
/// Places variables with the ledger's packing rules and fills in the type
/// table, producing the same shape a compiler would emit.
///
/// ```rust,ignore
/// let layout = LayoutBuilder::new()
///     .var("value", "t_uint256")
///     .var("owner", "t_address")
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct LayoutBuilder {
    vars: Vec<(String, String)>,
    types: BTreeMap<String, RawTypeInfo>,
}

impl LayoutBuilder {
    /// Create empty builder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a state variable
    #[must_use]
    pub fn var(mut self, label: &str, type_id: &str) -> Self {
        self.vars.push((label.to_string(), type_id.to_string()));
        self
    }

    /// Declare a struct type from `(member, type_id)` pairs
    ///
    /// Members are packed like top-level variables, relative to the
    /// struct's first slot.
    ///
    /// # Errors
    /// Returns an error if a member type cannot be resolved.
    pub fn define_struct(
        mut self,
        type_id: &str,
        label: &str,
        members: &[(&str, &str)],
    ) -> Result<Self, LayoutError> {
        let items = self.place(members.iter().map(|(l, t)| (*l, *t)))?;
        let bytes = items.last().map_or(u64::from(SLOT_BYTES), |(item, width, aligned)| {
            Cursor::after(item.slot, item.offset, *width, *aligned).slots_touched()
                * u64::from(SLOT_BYTES)
        });
        self.types.insert(
            type_id.to_string(),
            RawTypeInfo {
                label: label.to_string(),
                number_of_bytes: bytes,
                members: Some(items.into_iter().map(|(item, _, _)| item).collect()),
            },
        );
        Ok(self)
    }

    /// Produce the layout section
    ///
    /// # Errors
    /// Returns an error if a variable type cannot be resolved.
    pub fn build(mut self) -> Result<RawStorageLayout, LayoutError> {
        let vars = std::mem::take(&mut self.vars);
        let items = self.place(vars.iter().map(|(l, t)| (l.as_str(), t.as_str())))?;
        Ok(RawStorageLayout {
            storage: items.into_iter().map(|(item, _, _)| item).collect(),
            types: self.types,
        })
    }

    fn place<'v>(
        &mut self,
        vars: impl Iterator<Item = (&'v str, &'v str)>,
    ) -> Result<Vec<(RawStorageItem, u32, bool)>, LayoutError> {
        let mut cursor = Cursor::default();
        let mut items = Vec::new();
        for (label, type_id) in vars {
            let tag = TypeTag::parse_id(type_id, &self.types)?;
            let width = resolve_width(label, type_id, &tag, &self.types)?;
            let aligned = tag.is_slot_aligned();
            let (slot, offset) = cursor.place(width, aligned);
            cursor = Cursor::after(slot, offset, width, aligned);
            self.types
                .entry(type_id.to_string())
                .or_insert_with(|| RawTypeInfo {
                    label: tag.to_string(),
                    number_of_bytes: u64::from(width),
                    members: None,
                });
            items.push((RawStorageItem::new(label, slot, offset, type_id), width, aligned));
        }
        Ok(items)
    }
}

/// Compiler output encodes numbers as decimal strings; accept both forms.
mod lenient_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    pub(super) fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match NumOrString::deserialize(deserializer)? {
            NumOrString::Num(n) => Ok(n),
            NumOrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
