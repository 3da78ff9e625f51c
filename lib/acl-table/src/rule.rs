// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rule specifications and compiled field matchers.

use acl_api::AclError;
use acl_api::FieldDef;
use acl_api::FieldSchema;
use acl_api::FieldType;
use acl_api::FieldValue;
use acl_api::MAX_PRIORITY;
use core::fmt;
use core::fmt::Display;

type Result<T> = core::result::Result<T, AclError>;

/// A rule as submitted by the caller: one match value per schema field
/// plus a requested priority.
///
/// The field-value vector is the rule's key; two rules with equal
/// vectors are duplicates regardless of priority.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleSpec {
    fields: Vec<FieldValue>,
    priority: u32,
}

impl RuleSpec {
    /// Validate a field vector and priority against the schema.
    pub fn new(
        fields: Vec<FieldValue>,
        priority: u32,
        schema: &FieldSchema,
    ) -> Result<Self> {
        if priority > MAX_PRIORITY {
            return Err(AclError::BadPriority {
                given: priority,
                max: MAX_PRIORITY,
            });
        }

        validate_fields(&fields, schema)?;
        Ok(Self { fields, priority })
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Raw-key equality, used for duplicate detection. Compares the
    /// stored field values exactly; it does not ask whether two rules
    /// would match the same packets.
    pub fn key_eq(&self, fields: &[FieldValue]) -> bool {
        self.fields == fields
    }
}

impl Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "prio={} ", self.priority)?;
        for (i, fv) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "f{i}{fv}")?;
        }
        Ok(())
    }
}

/// Check a field-value vector against the schema: one value per field,
/// each variant agreeing with the field's declared type, each value
/// fitting in the field's width, ranges properly ordered.
pub(crate) fn validate_fields(
    fields: &[FieldValue],
    schema: &FieldSchema,
) -> Result<()> {
    if fields.len() != schema.num_fields() {
        return Err(AclError::SchemaMismatch {
            expected: schema.num_fields(),
            given: fields.len(),
        });
    }

    for (i, (def, fv)) in schema.defs().iter().zip(fields.iter()).enumerate() {
        let width = width_mask(def.size);

        let ok_type = matches!(
            (def.field_type, fv),
            (FieldType::Exact, FieldValue::Exact(_))
                | (FieldType::Bitmask, FieldValue::Bitmask { .. })
                | (FieldType::Range, FieldValue::Range { .. })
        );
        if !ok_type {
            return Err(AclError::BadFieldValue {
                field: i,
                msg: format!(
                    "value {fv} does not agree with field type {:?}",
                    def.field_type,
                ),
            });
        }

        let fits = match *fv {
            FieldValue::Exact(v) => v <= width,
            FieldValue::Bitmask { value, mask } => {
                value <= width && mask <= width
            }
            FieldValue::Range { lo, hi } => {
                if lo > hi {
                    return Err(AclError::BadFieldValue {
                        field: i,
                        msg: format!("range lo 0x{lo:x} > hi 0x{hi:x}"),
                    });
                }
                hi <= width
            }
        };
        if !fits {
            return Err(AclError::BadFieldValue {
                field: i,
                msg: format!(
                    "value {fv} does not fit in {} byte(s)",
                    def.size,
                ),
            });
        }
    }

    Ok(())
}

pub(crate) fn width_mask(size: usize) -> u64 {
    if size >= 8 { u64::MAX } else { (1u64 << (8 * size)) - 1 }
}

/// A compiled matcher for one field: where to read, how many bytes,
/// and the test to apply.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FieldMatcher {
    pub offset: usize,
    pub size: usize,
    pub test: MatchTest,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum MatchTest {
    Exact(u64),
    Bitmask { value: u64, mask: u64 },
    Range { lo: u64, hi: u64 },
}

impl FieldMatcher {
    /// The value is assumed validated against the definition.
    pub fn compile(def: &FieldDef, fv: &FieldValue) -> Self {
        let test = match *fv {
            FieldValue::Exact(v) => MatchTest::Exact(v),
            FieldValue::Bitmask { value, mask } => {
                // Canonicalize so that stray value bits outside the
                // mask cannot make the matcher unsatisfiable.
                MatchTest::Bitmask { value: value & mask, mask }
            }
            FieldValue::Range { lo, hi } => MatchTest::Range { lo, hi },
        };

        Self { offset: def.offset, size: def.size, test }
    }

    /// Does the packet match this field? A packet too short to cover
    /// the field's byte region never matches.
    pub fn matches(&self, pkt: &[u8]) -> bool {
        let Some(v) = extract(pkt, self.offset, self.size) else {
            return false;
        };

        match self.test {
            MatchTest::Exact(want) => v == want,
            MatchTest::Bitmask { value, mask } => v & mask == value,
            MatchTest::Range { lo, hi } => lo <= v && v <= hi,
        }
    }
}

/// Read `size` bytes at `offset` as a big-endian integer.
pub(crate) fn extract(pkt: &[u8], offset: usize, size: usize) -> Option<u64> {
    let bytes = pkt.get(offset..offset.checked_add(size)?)?;
    let mut v = 0u64;
    for b in bytes {
        v = (v << 8) | u64::from(*b);
    }
    Some(v)
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> FieldSchema {
        FieldSchema::new(vec![
            FieldDef { field_type: FieldType::Exact, offset: 0, size: 4 },
            FieldDef { field_type: FieldType::Range, offset: 4, size: 2 },
        ])
        .unwrap()
    }

    #[test]
    fn extract_is_big_endian() {
        let pkt = [0x0a, 0x00, 0x00, 0x01, 0x00, 0x50];
        assert_eq!(extract(&pkt, 0, 4), Some(0x0a000001));
        assert_eq!(extract(&pkt, 4, 2), Some(0x0050));
        assert_eq!(extract(&pkt, 4, 4), None);
        assert_eq!(extract(&pkt, usize::MAX, 2), None);
    }

    #[test]
    fn spec_validation() {
        let s = schema();

        let ok = RuleSpec::new(
            vec![
                FieldValue::Exact(0x0a000001),
                FieldValue::Range { lo: 80, hi: 443 },
            ],
            7,
            &s,
        )
        .unwrap();
        assert_eq!(ok.priority(), 7);

        // Too high a priority.
        assert!(matches!(
            RuleSpec::new(
                vec![
                    FieldValue::Exact(1),
                    FieldValue::Range { lo: 0, hi: 1 },
                ],
                MAX_PRIORITY + 1,
                &s,
            ),
            Err(AclError::BadPriority { .. })
        ));

        // Wrong field count.
        assert!(matches!(
            RuleSpec::new(vec![FieldValue::Exact(1)], 0, &s),
            Err(AclError::SchemaMismatch { expected: 2, given: 1 })
        ));

        // Variant disagrees with the field type.
        assert!(matches!(
            RuleSpec::new(
                vec![
                    FieldValue::Range { lo: 0, hi: 1 },
                    FieldValue::Range { lo: 0, hi: 1 },
                ],
                0,
                &s,
            ),
            Err(AclError::BadFieldValue { field: 0, .. })
        ));

        // Inverted range.
        assert!(matches!(
            RuleSpec::new(
                vec![
                    FieldValue::Exact(1),
                    FieldValue::Range { lo: 2, hi: 1 },
                ],
                0,
                &s,
            ),
            Err(AclError::BadFieldValue { field: 1, .. })
        ));

        // Value wider than the field.
        assert!(matches!(
            RuleSpec::new(
                vec![
                    FieldValue::Exact(1),
                    FieldValue::Range { lo: 0, hi: 0x1_0000 },
                ],
                0,
                &s,
            ),
            Err(AclError::BadFieldValue { field: 1, .. })
        ));
    }

    #[test]
    fn matcher_tests() {
        let exact = FieldMatcher {
            offset: 0,
            size: 4,
            test: MatchTest::Exact(0x0a000001),
        };
        assert!(exact.matches(&[0x0a, 0, 0, 1, 0xff]));
        assert!(!exact.matches(&[0x0a, 0, 0, 2]));
        // Short packet.
        assert!(!exact.matches(&[0x0a, 0, 0]));

        let masked = FieldMatcher {
            offset: 1,
            size: 2,
            test: MatchTest::Bitmask { value: 0x0100, mask: 0x0f00 },
        };
        assert!(masked.matches(&[0xaa, 0x01, 0x99]));
        assert!(masked.matches(&[0xaa, 0xf1, 0x00]));
        assert!(!masked.matches(&[0xaa, 0x02, 0x00]));

        let range = FieldMatcher {
            offset: 0,
            size: 2,
            test: MatchTest::Range { lo: 0x01ff, hi: 0x0202 },
        };
        assert!(range.matches(&[0x01, 0xff]));
        assert!(range.matches(&[0x02, 0x00]));
        assert!(range.matches(&[0x02, 0x02]));
        assert!(!range.matches(&[0x01, 0xfe]));
        assert!(!range.matches(&[0x02, 0x03]));
    }

    #[test]
    fn key_eq_ignores_priority() {
        let s = schema();
        let fields = vec![
            FieldValue::Exact(0x0a000001),
            FieldValue::Range { lo: 80, hi: 80 },
        ];
        let r1 = RuleSpec::new(fields.clone(), 1, &s).unwrap();
        let r2 = RuleSpec::new(fields.clone(), 9, &s).unwrap();
        assert!(r1.key_eq(r2.fields()));
        assert!(r1.key_eq(&fields));
    }

    #[test]
    fn bitmask_value_canonicalized() {
        let def =
            FieldDef { field_type: FieldType::Bitmask, offset: 0, size: 1 };
        // Value bits outside the mask must not prevent matching.
        let m = FieldMatcher::compile(
            &def,
            &FieldValue::Bitmask { value: 0xff, mask: 0xf0 },
        );
        assert!(m.matches(&[0xf3]));
        assert!(!m.matches(&[0xe3]));
    }
}
