// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A burst-oriented ACL packet-classification table.
//!
//! An [`AclTable`] maps packet header fields to a user-defined action
//! entry via exact/bitmask/range matching with priority resolution.
//! Rule adds and deletes recompile the active rule set into a brand-new
//! immutable classification context which is published with a single
//! owned-pointer swap, so a lookup always observes either the table
//! before a mutation or after it, never a half-built structure.
//!
//! The caller is responsible for serializing mutation against lookup;
//! the table itself takes no locks.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod classify;
pub mod lookup;
pub mod print;
pub mod rule;
pub mod table;

pub use acl_api as api;
pub use table::AclTable;
pub use table::AddOutcome;
