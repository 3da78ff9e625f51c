// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The API types shared between the ACL table engine and its
//! consumers: the match-field schema, per-rule match values, creation
//! parameters, dump types, and the error taxonomy.
//!
//! Nothing in this crate performs classification; it only describes
//! tables and rules. The engine lives in the `acl-table` crate.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The maximum number of match fields a table schema may define.
pub const MAX_FIELDS: usize = 64;

/// The maximum number of header bytes a schema may examine: every
/// field's byte region must end at or before this offset. Classifier
/// build time and memory scale with the span, so it is bounded here
/// rather than at lookup time.
pub const MAX_SPAN: usize = 4096;

/// The maximum priority a rule may request. Higher requested priority
/// wins among overlapping rules.
pub const MAX_PRIORITY: u32 = i32::MAX as u32;

/// The maximum number of packets in one lookup burst. The packet
/// selection mask is a `u64`, one bit per burst slot.
pub const BURST_SIZE_MAX: usize = 64;

/// Slot 0 of the rule/action arrays is reserved and never matched; it
/// doubles as the "no match" sentinel in compiled results.
pub const RESERVED_SLOT: u32 = 0;

/// How a field's match value is interpreted.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FieldType {
    /// The packet value must equal the rule value.
    Exact,
    /// The packet value ANDed with the rule mask must equal the rule
    /// value ANDed with the same mask. A mask of zero matches anything.
    Bitmask,
    /// The packet value must fall within the rule's inclusive range.
    Range,
}

/// One match field of a table schema: its type, its byte offset within
/// the packet header region, and its width in bytes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FieldDef {
    pub field_type: FieldType,
    pub offset: usize,
    pub size: usize,
}

/// The ordered match-field layout of a table, fixed at creation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FieldSchema {
    defs: Vec<FieldDef>,
}

impl FieldSchema {
    /// Create a schema from an ordered field list.
    ///
    /// # Errors
    ///
    /// There must be at least one field and at most [`MAX_FIELDS`];
    /// each field must be 1, 2, 4, or 8 bytes wide and its byte region
    /// must end at or before [`MAX_SPAN`].
    pub fn new(defs: Vec<FieldDef>) -> Result<Self, AclError> {
        if defs.is_empty() {
            return Err(AclError::InvalidParam(
                "schema defines no fields".to_string(),
            ));
        }

        if defs.len() > MAX_FIELDS {
            return Err(AclError::InvalidParam(format!(
                "schema defines {} fields, maximum is {}",
                defs.len(),
                MAX_FIELDS,
            )));
        }

        for (i, def) in defs.iter().enumerate() {
            if !matches!(def.size, 1 | 2 | 4 | 8) {
                return Err(AclError::InvalidParam(format!(
                    "field {} has size {}, must be 1, 2, 4, or 8",
                    i, def.size,
                )));
            }

            match def.offset.checked_add(def.size) {
                Some(end) if end <= MAX_SPAN => (),
                _ => {
                    return Err(AclError::InvalidParam(format!(
                        "field {} ends past the {}-byte header span limit",
                        i, MAX_SPAN,
                    )));
                }
            }
        }

        Ok(Self { defs })
    }

    pub fn defs(&self) -> &[FieldDef] {
        &self.defs
    }

    pub fn num_fields(&self) -> usize {
        self.defs.len()
    }

    /// The number of header bytes examined by this schema: one past
    /// the last byte of the furthest-reaching field.
    pub fn span(&self) -> usize {
        self.defs.iter().map(|d| d.offset + d.size).max().unwrap_or(0)
    }
}

/// The match value for a single field of a rule. The variant must
/// agree with the field's declared [`FieldType`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FieldValue {
    Exact(u64),
    Bitmask { value: u64, mask: u64 },
    Range { lo: u64, hi: u64 },
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "=0x{v:x}"),
            Self::Bitmask { value, mask } => {
                write!(f, "&0x{mask:x}=0x{value:x}")
            }
            Self::Range { lo, hi } => write!(f, "∈(0x{lo:x}..=0x{hi:x})"),
        }
    }
}

/// Parameters for creating an ACL table.
///
/// `n_rules` is the total number of rule slots, including the reserved
/// sentinel slot 0; a table can therefore hold `n_rules - 1` rules.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AclTableParams {
    pub name: String,
    pub n_rules: u32,
    pub schema: FieldSchema,
}

/// A dump of one occupied rule slot.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleDump {
    pub slot: u32,
    pub priority: u32,
    pub fields: Vec<String>,
}

/// A dump of a table's occupied slots.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AclTableDump {
    pub name: String,
    pub n_rules: u32,
    pub entry_size: usize,
    pub rules: Vec<RuleDump>,
}

/// Errors returned by the ACL table engine.
///
/// All failures are synchronous and local; none leave the table in a
/// partially mutated state.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum AclError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("priority {given} exceeds maximum {max}")]
    BadPriority { given: u32, max: u32 },

    #[error("rule has {given} fields, schema defines {expected}")]
    SchemaMismatch { expected: usize, given: usize },

    #[error("field {field}: {msg}")]
    BadFieldValue { field: usize, msg: String },

    #[error("no free rule slot, capacity is {capacity}")]
    TableFull { capacity: u32 },

    #[error("classifier build failed: {0}")]
    BuildFailed(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn exact(offset: usize, size: usize) -> FieldDef {
        FieldDef { field_type: FieldType::Exact, offset, size }
    }

    #[test]
    fn schema_validation() {
        assert!(matches!(
            FieldSchema::new(vec![]),
            Err(AclError::InvalidParam(_))
        ));

        assert!(matches!(
            FieldSchema::new(vec![exact(0, 3)]),
            Err(AclError::InvalidParam(_))
        ));

        let schema = FieldSchema::new(vec![exact(0, 4), exact(4, 2)]).unwrap();
        assert_eq!(schema.num_fields(), 2);
        assert_eq!(schema.span(), 6);
    }

    #[test]
    fn schema_span_is_capped() {
        // A field far out in the header region would otherwise make
        // span-sized classifier allocations unbounded.
        assert!(matches!(
            FieldSchema::new(vec![exact(1 << 40, 1)]),
            Err(AclError::InvalidParam(_))
        ));
        assert!(matches!(
            FieldSchema::new(vec![exact(usize::MAX, 8)]),
            Err(AclError::InvalidParam(_))
        ));

        // The last byte may land exactly on the cap.
        let schema = FieldSchema::new(vec![exact(MAX_SPAN - 4, 4)]).unwrap();
        assert_eq!(schema.span(), MAX_SPAN);
    }

    #[test]
    fn schema_span_uses_furthest_field() {
        // Fields need not be contiguous or ordered by offset.
        let schema = FieldSchema::new(vec![exact(8, 2), exact(0, 1)]).unwrap();
        assert_eq!(schema.span(), 10);
    }

    #[test]
    fn field_value_display() {
        assert_eq!(FieldValue::Exact(0x50).to_string(), "=0x50");
        assert_eq!(
            FieldValue::Bitmask { value: 0x10, mask: 0xf0 }.to_string(),
            "&0xf0=0x10"
        );
        assert_eq!(
            FieldValue::Range { lo: 1, hi: 0xffff }.to_string(),
            "∈(0x1..=0xffff)"
        );
    }

    #[test]
    fn params_roundtrip_serde() {
        let params = AclTableParams {
            name: "fw".to_string(),
            n_rules: 16,
            schema: FieldSchema::new(vec![exact(0, 4)]).unwrap(),
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: AclTableParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }
}
