//! Storage type tags
//!
//! [`TypeTag`] is the structural identity of a state variable's type. Two
//! slots hold interchangeable bytes only if their tags are equal, so tags
//! carry everything that affects the encoding: integer widths, mapping key
//! and value types, array lengths and struct members.
//!
//! Tags are parsed from compiler type identifiers such as `t_uint256`,
//! `t_mapping(t_address,t_uint256)` or `t_array(t_bytes32)4_storage`.

use crate::layout::{LayoutError, RawTypeInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Nesting limit when resolving type identifiers
const MAX_TYPE_DEPTH: usize = 32;

/// Structural type of a storage slot entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeTag {
    /// Unsigned integer of `bits` width
    Uint { bits: u16 },
    /// Signed integer of `bits` width
    Int { bits: u16 },
    /// Boolean
    Bool,
    /// 20-byte address
    Address,
    /// Fixed-size byte array `bytesN`
    FixedBytes { len: u8 },
    /// Dynamic UTF-8 string
    String,
    /// Dynamic byte array
    Bytes,
    /// Enumeration
    Enum { name: String },
    /// Contract reference (stored as an address)
    Contract { name: String },
    /// Key/value mapping
    Mapping {
        key: Box<TypeTag>,
        value: Box<TypeTag>,
    },
    /// Dynamically sized array
    DynamicArray { element: Box<TypeTag> },
    /// Fixed-length array
    StaticArray { element: Box<TypeTag>, len: u64 },
    /// Struct with its members in declaration order
    Struct { name: String, members: Vec<TypeTag> },
    /// Struct referring to itself (or an enclosing struct) through a
    /// mapping or dynamic array; its members are those of the enclosing
    /// [`TypeTag::Struct`] with the same name
    StructRef { name: String },
}

impl TypeTag {
    /// Parse a compiler type identifier against the layout's type table
    ///
    /// The table is only consulted for struct members; every other type is
    /// fully described by its identifier.
    ///
    /// # Errors
    /// Returns [`LayoutError::MalformedTypeId`] for identifiers that do not
    /// follow the grammar and [`LayoutError::UnknownType`] for struct types
    /// missing from the table.
    pub fn parse_id(id: &str, types: &BTreeMap<String, RawTypeInfo>) -> Result<Self, LayoutError> {
        let mut parser = TypeIdParser {
            input: id,
            pos: 0,
            types,
            depth: 0,
            resolving: Vec::new(),
        };
        let tag = parser.parse()?;
        if parser.pos != id.len() {
            return Err(parser.malformed("trailing characters"));
        }
        Ok(tag)
    }

    /// Width in bytes implied by the type alone
    ///
    /// `None` for static arrays and structs, whose width comes from the
    /// compiler's type table.
    #[must_use]
    pub fn natural_width(&self) -> Option<u32> {
        match self {
            Self::Uint { bits } | Self::Int { bits } => Some(u32::from(*bits) / 8),
            Self::Bool | Self::Enum { .. } => Some(1),
            Self::Address | Self::Contract { .. } => Some(20),
            Self::FixedBytes { len } => Some(u32::from(*len)),
            Self::String | Self::Bytes | Self::Mapping { .. } | Self::DynamicArray { .. } => {
                Some(32)
            }
            Self::StaticArray { .. } | Self::Struct { .. } | Self::StructRef { .. } => None,
        }
    }

    /// Whether values of this type always start (and end) on a slot boundary
    #[must_use]
    pub fn is_slot_aligned(&self) -> bool {
        matches!(
            self,
            Self::String
                | Self::Bytes
                | Self::Mapping { .. }
                | Self::DynamicArray { .. }
                | Self::StaticArray { .. }
                | Self::Struct { .. }
                | Self::StructRef { .. }
        )
    }
}

impl Display for TypeTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint { bits } => write!(f, "uint{bits}"),
            Self::Int { bits } => write!(f, "int{bits}"),
            Self::Bool => f.write_str("bool"),
            Self::Address => f.write_str("address"),
            Self::FixedBytes { len } => write!(f, "bytes{len}"),
            Self::String => f.write_str("string"),
            Self::Bytes => f.write_str("bytes"),
            Self::Enum { name } => write!(f, "enum {name}"),
            Self::Contract { name } => write!(f, "contract {name}"),
            Self::Mapping { key, value } => write!(f, "mapping({key} => {value})"),
            Self::DynamicArray { element } => write!(f, "{element}[]"),
            Self::StaticArray { element, len } => write!(f, "{element}[{len}]"),
            Self::Struct { name, .. } | Self::StructRef { name } => write!(f, "struct {name}"),
        }
    }
}

/// Recursive-descent parser over a compiler type identifier
struct TypeIdParser<'a> {
    input: &'a str,
    pos: usize,
    types: &'a BTreeMap<String, RawTypeInfo>,
    depth: usize,
    /// Struct ids whose members are being resolved
    resolving: Vec<String>,
}

impl TypeIdParser<'_> {
    fn parse(&mut self) -> Result<TypeTag, LayoutError> {
        self.depth += 1;
        if self.depth > MAX_TYPE_DEPTH {
            return Err(LayoutError::TypeTooDeep {
                id: self.input.to_string(),
            });
        }
        let start = self.pos;
        self.expect("t_")?;

        let tag = if self.eat("mapping(") {
            let key = self.parse()?;
            self.expect(",")?;
            let value = self.parse()?;
            self.expect(")")?;
            TypeTag::Mapping {
                key: Box::new(key),
                value: Box::new(value),
            }
        } else if self.eat("array(") {
            let element = Box::new(self.parse()?);
            self.expect(")")?;
            let tag = if self.eat("dyn") {
                TypeTag::DynamicArray { element }
            } else {
                let len = self.number()?;
                TypeTag::StaticArray { element, len }
            };
            self.eat_location();
            tag
        } else if self.eat("struct(") {
            let name = self.name()?;
            self.number()?;
            self.eat_location();
            let input = self.input;
            let id = &input[start..self.pos];
            if self.resolving.iter().any(|open| open == id) {
                TypeTag::StructRef { name }
            } else {
                let members = self.struct_members(id)?;
                TypeTag::Struct { name, members }
            }
        } else if self.eat("enum(") {
            let name = self.name()?;
            self.number()?;
            TypeTag::Enum { name }
        } else if self.eat("contract(") {
            let name = self.name()?;
            self.number()?;
            TypeTag::Contract { name }
        } else {
            self.elementary()?
        };

        self.depth -= 1;
        Ok(tag)
    }

    fn struct_members(&self, id: &str) -> Result<Vec<TypeTag>, LayoutError> {
        let info = self
            .types
            .get(id)
            .ok_or_else(|| LayoutError::UnknownType { id: id.to_string() })?;
        let mut resolving = self.resolving.clone();
        resolving.push(id.to_string());
        info.members
            .iter()
            .flatten()
            .map(|member| {
                let mut nested = TypeIdParser {
                    input: &member.type_id,
                    pos: 0,
                    types: self.types,
                    depth: self.depth,
                    resolving: resolving.clone(),
                };
                let tag = nested.parse()?;
                if nested.pos != member.type_id.len() {
                    return Err(nested.malformed("trailing characters"));
                }
                Ok(tag)
            })
            .collect()
    }

    fn elementary(&mut self) -> Result<TypeTag, LayoutError> {
        let word_start = self.pos;
        while let Some(c) = self.peek() {
            if c == ',' || c == ')' {
                break;
            }
            self.pos += c.len_utf8();
        }
        let word = &self.input[word_start..self.pos];
        let base = word
            .strip_suffix("_storage")
            .or_else(|| word.strip_suffix("_memory_ptr"))
            .unwrap_or(word);

        match base {
            "bool" => return Ok(TypeTag::Bool),
            "address" | "address_payable" => return Ok(TypeTag::Address),
            "string" => return Ok(TypeTag::String),
            "bytes" => return Ok(TypeTag::Bytes),
            _ => {}
        }

        if let Some(bits) = base.strip_prefix("uint") {
            return Ok(TypeTag::Uint {
                bits: self.integer_bits(bits)?,
            });
        }
        if let Some(bits) = base.strip_prefix("int") {
            return Ok(TypeTag::Int {
                bits: self.integer_bits(bits)?,
            });
        }
        if let Some(len) = base.strip_prefix("bytes") {
            let len: u8 = len
                .parse()
                .map_err(|_| self.malformed("invalid fixed bytes length"))?;
            if !(1..=32).contains(&len) {
                return Err(self.malformed("fixed bytes length out of range"));
            }
            return Ok(TypeTag::FixedBytes { len });
        }

        Err(self.malformed("unknown elementary type"))
    }

    fn integer_bits(&self, digits: &str) -> Result<u16, LayoutError> {
        let bits: u16 = digits
            .parse()
            .map_err(|_| self.malformed("invalid integer width"))?;
        if bits == 0 || bits > 256 || bits % 8 != 0 {
            return Err(self.malformed("integer width out of range"));
        }
        Ok(bits)
    }

    fn name(&mut self) -> Result<String, LayoutError> {
        let rest = &self.input[self.pos..];
        let end = rest
            .find(')')
            .ok_or_else(|| self.malformed("unterminated name"))?;
        let name = rest[..end].to_string();
        if name.is_empty() {
            return Err(self.malformed("empty name"));
        }
        self.pos += end + 1;
        Ok(name)
    }

    fn number(&mut self) -> Result<u64, LayoutError> {
        let rest = &self.input[self.pos..];
        let len = rest.bytes().take_while(u8::is_ascii_digit).count();
        if len == 0 {
            return Err(self.malformed("expected number"));
        }
        let n = rest[..len]
            .parse()
            .map_err(|_| self.malformed("number out of range"))?;
        self.pos += len;
        Ok(n)
    }

    fn eat_location(&mut self) {
        let _ = self.eat("_storage") || self.eat("_memory_ptr");
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.input[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), LayoutError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.malformed(&format!("expected `{token}` at byte {}", self.pos)))
        }
    }

    fn malformed(&self, reason: &str) -> LayoutError {
        LayoutError::MalformedTypeId {
            id: self.input.to_string(),
            reason: reason.to_string(),
        }
    }
}
