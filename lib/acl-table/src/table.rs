// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ACL table manager.
//!
//! Owns the parallel rule-slot and action-entry arrays plus the
//! currently published classification context. Add and delete are
//! transactional: the rule store is mutated, a brand-new context is
//! built from the result, and only on success is the new context
//! published (dropping the old one); a failed build rolls the store
//! mutation back and leaves the prior context live.

use crate::classify::ClassifierCtx;
use crate::classify::CompiledRule;
use crate::rule::validate_fields;
use crate::rule::FieldMatcher;
use crate::rule::RuleSpec;
use acl_api::AclError;
use acl_api::AclTableDump;
use acl_api::AclTableParams;
use acl_api::FieldSchema;
use acl_api::FieldValue;
use acl_api::RuleDump;
use itertools::zip_eq;

type Result<T> = core::result::Result<T, AclError>;

/// The result of a successful [`AclTable::add`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddOutcome {
    /// True when the key already existed and only its entry payload
    /// was replaced.
    pub existing: bool,
    /// The rule's slot index; also the index returned by lookups that
    /// hit this rule.
    pub slot: u32,
}

/// A burst-oriented rule table mapping packet header fields to a
/// user-defined action entry.
#[derive(Debug)]
pub struct AclTable {
    name: String,
    schema: FieldSchema,
    n_rules: u32,
    entry_size: usize,

    /// Slot-indexed rule store; slot 0 is reserved and never occupied.
    rules: Vec<Option<RuleSpec>>,
    /// Action entries, `entry_size` bytes per slot, parallel to
    /// `rules`.
    entries: Vec<u8>,

    pub(crate) ctx: Option<ClassifierCtx>,

    #[cfg(any(test, feature = "test-help"))]
    fail_next_build: bool,
}

impl AclTable {
    /// Create a table. `entry_size` is the caller's action payload
    /// size; storage is rounded up to an 8-byte multiple.
    pub fn new(params: AclTableParams, entry_size: usize) -> Result<Self> {
        if params.name.is_empty() {
            return Err(AclError::InvalidParam(
                "table name is empty".to_string(),
            ));
        }

        // Slot 0 is reserved, so 2 slots is the smallest useful table.
        if params.n_rules < 2 {
            return Err(AclError::InvalidParam(format!(
                "n_rules is {}, need at least 2",
                params.n_rules,
            )));
        }

        if entry_size == 0 {
            return Err(AclError::InvalidParam(
                "entry_size is zero".to_string(),
            ));
        }

        let entry_size = entry_size.next_multiple_of(8);
        let n_slots = params.n_rules as usize;

        Ok(Self {
            name: params.name,
            schema: params.schema,
            n_rules: params.n_rules,
            entry_size,
            rules: vec![None; n_slots],
            entries: vec![0; n_slots * entry_size],
            ctx: None,
            #[cfg(any(test, feature = "test-help"))]
            fail_next_build: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// The number of usable rule slots (`n_rules` minus the reserved
    /// sentinel slot).
    pub fn capacity(&self) -> u32 {
        self.n_rules - 1
    }

    /// The number of occupied rule slots.
    pub fn num_rules(&self) -> u32 {
        self.rules.iter().filter(|r| r.is_some()).count() as u32
    }

    /// The stored (rounded) entry size.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// The action entry for `slot`. This panics if `slot` is outside
    /// the table's slot array; callers hold a slot returned by the
    /// table itself.
    pub fn entry(&self, slot: u32) -> &[u8] {
        let start = slot as usize * self.entry_size;
        &self.entries[start..start + self.entry_size]
    }

    fn write_entry(&mut self, slot: u32, data: &[u8]) {
        let start = slot as usize * self.entry_size;
        let dst = &mut self.entries[start..start + self.entry_size];
        dst[..data.len()].copy_from_slice(data);
        dst[data.len()..].fill(0);
    }

    /// Add a rule, or update the entry of an existing duplicate key.
    ///
    /// A duplicate update replaces the action payload in place and
    /// needs no rebuild; the stored priority is untouched since the
    /// match key is unchanged. A new rule takes the first free slot,
    /// triggers a full context rebuild, and is rolled back if the
    /// build fails.
    pub fn add(
        &mut self,
        fields: &[FieldValue],
        priority: u32,
        entry: &[u8],
    ) -> Result<AddOutcome> {
        let spec = RuleSpec::new(fields.to_vec(), priority, &self.schema)?;

        if entry.len() > self.entry_size {
            return Err(AclError::InvalidParam(format!(
                "entry is {} bytes, table entry size is {}",
                entry.len(),
                self.entry_size,
            )));
        }

        // One pass finds both the duplicate and the first free slot.
        let mut free = None;
        for slot in 1..self.n_rules {
            match &self.rules[slot as usize] {
                None => {
                    if free.is_none() {
                        free = Some(slot);
                    }
                }

                Some(r) if r.key_eq(spec.fields()) => {
                    self.write_entry(slot, entry);
                    return Ok(AddOutcome { existing: true, slot });
                }

                Some(_) => {}
            }
        }

        let Some(slot) = free else {
            return Err(AclError::TableFull { capacity: self.capacity() });
        };

        self.rules[slot as usize] = Some(spec);
        match self.rebuild() {
            Ok(ctx) => {
                self.ctx = ctx;
                self.write_entry(slot, entry);
                Ok(AddOutcome { existing: false, slot })
            }

            Err(e) => {
                // Roll back; the prior context stays authoritative.
                self.rules[slot as usize] = None;
                Err(e)
            }
        }
    }

    /// Delete the rule with exactly these field values.
    ///
    /// Returns the removed action payload, or `Ok(None)` when no rule
    /// has this key (not an error). A failed rebuild restores the
    /// rule and reports the error.
    pub fn delete(&mut self, fields: &[FieldValue]) -> Result<Option<Vec<u8>>> {
        validate_fields(fields, &self.schema)?;

        let found = (1..self.n_rules).find(|&slot| {
            self.rules[slot as usize]
                .as_ref()
                .is_some_and(|r| r.key_eq(fields))
        });
        let Some(slot) = found else {
            return Ok(None);
        };

        let removed = self.rules[slot as usize].take();
        match self.rebuild() {
            Ok(ctx) => {
                self.ctx = ctx;
                Ok(Some(self.entry(slot).to_vec()))
            }

            Err(e) => {
                self.rules[slot as usize] = removed;
                Err(e)
            }
        }
    }

    /// Build a fresh context from the current rule store. Zero active
    /// rules yield no context at all; lookups then report zero hits.
    fn rebuild(&mut self) -> Result<Option<ClassifierCtx>> {
        #[cfg(any(test, feature = "test-help"))]
        if self.fail_next_build {
            self.fail_next_build = false;
            return Err(AclError::BuildFailed(
                "injected build fault".to_string(),
            ));
        }

        let active: Vec<CompiledRule> = self
            .rules
            .iter()
            .enumerate()
            .filter_map(|(slot, r)| {
                r.as_ref().map(|spec| self.compile(slot as u32, spec))
            })
            .collect();

        if active.is_empty() {
            return Ok(None);
        }

        ClassifierCtx::build(active, self.schema.span()).map(Some)
    }

    fn compile(&self, slot: u32, spec: &RuleSpec) -> CompiledRule {
        let matchers = zip_eq(self.schema.defs(), spec.fields())
            .map(|(def, fv)| FieldMatcher::compile(def, fv))
            .collect();
        CompiledRule::new(slot, spec.priority(), matchers)
    }

    /// Snapshot the occupied slots for diagnostics.
    pub fn dump(&self) -> AclTableDump {
        let rules = self
            .rules
            .iter()
            .enumerate()
            .filter_map(|(slot, r)| {
                r.as_ref().map(|spec| RuleDump {
                    slot: slot as u32,
                    priority: spec.priority(),
                    fields: spec
                        .fields()
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                })
            })
            .collect();

        AclTableDump {
            name: self.name.clone(),
            n_rules: self.n_rules,
            entry_size: self.entry_size,
            rules,
        }
    }

    /// Make the next context build fail, deterministically exercising
    /// the rollback path.
    #[cfg(any(test, feature = "test-help"))]
    pub fn fail_next_build(&mut self) {
        self.fail_next_build = true;
    }
}
