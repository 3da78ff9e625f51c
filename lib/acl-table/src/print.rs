// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Print table dumps in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both operator tooling and integration tests.

use acl_api::AclTableDump;
use itertools::Itertools;
use std::io::Write;
use tabwriter::TabWriter;

/// Print an [`AclTableDump`].
pub fn print_table(dump: &AclTableDump) -> std::io::Result<()> {
    print_table_into(&mut std::io::stdout(), dump)
}

/// Print an [`AclTableDump`] to the given writer.
pub fn print_table_into(
    writer: &mut impl Write,
    dump: &AclTableDump,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(
        t,
        "Table {} ({} slots, entry size {})",
        dump.name, dump.n_rules, dump.entry_size,
    )?;
    write_hr(&mut t)?;
    writeln!(t, "SLOT\tPRIORITY\tFIELDS")?;
    for rule in &dump.rules {
        writeln!(
            t,
            "{}\t{}\t{}",
            rule.slot,
            rule.priority,
            rule.fields.iter().join(", "),
        )?;
    }
    t.flush()
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use acl_api::RuleDump;

    #[test]
    fn printed_dump_lists_rules() {
        let dump = AclTableDump {
            name: "fw".to_string(),
            n_rules: 8,
            entry_size: 8,
            rules: vec![RuleDump {
                slot: 1,
                priority: 5,
                fields: vec!["f0=0xa000001".to_string()],
            }],
        };

        let mut out = Vec::new();
        print_table_into(&mut out, &dump).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("Table fw"));
        assert!(s.contains("f0=0xa000001"));
    }
}
