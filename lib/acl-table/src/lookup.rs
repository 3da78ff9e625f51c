// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The burst lookup engine.
//!
//! Packets are handed over as opaque byte slices; a 64-bit mask
//! selects which burst slots participate. Selected packets are
//! compacted into a dense batch (original relative order preserved),
//! classified against the published context in one pass, and the
//! results scattered back by original bit position.

use crate::table::AclTable;
use acl_api::BURST_SIZE_MAX;

impl AclTable {
    /// Classify a burst of packets.
    ///
    /// Bit `i` of `pkts_mask` selects `pkts[i]`; mask bits at or
    /// beyond `pkts.len()` are ignored. For every selected packet that
    /// matches a rule, the corresponding bit is set in the returned
    /// hit mask and `entries[i]` receives a reference to the matched
    /// action entry; misses leave their `entries` slot untouched.
    ///
    /// A table with no published context (no active rules) reports
    /// zero hits. This is steady-state behavior, not an error.
    pub fn lookup<'a>(
        &'a self,
        pkts: &[&[u8]],
        pkts_mask: u64,
        entries: &mut [Option<&'a [u8]>],
    ) -> u64 {
        debug_assert!(pkts.len() <= BURST_SIZE_MAX);
        debug_assert!(entries.len() >= pkts.len());

        let Some(ctx) = &self.ctx else {
            return 0;
        };

        // Input conversion: compact the selected packets.
        let mut keys: heapless::Vec<&[u8], BURST_SIZE_MAX> =
            heapless::Vec::new();
        let mut pos: heapless::Vec<u8, BURST_SIZE_MAX> = heapless::Vec::new();

        let mut mask = pkts_mask & valid_mask(pkts.len());
        while mask != 0 {
            let i = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            // Cannot overflow: the mask holds at most BURST_SIZE_MAX
            // bits.
            if keys.push(pkts[i]).is_err() || pos.push(i as u8).is_err() {
                break;
            }
        }

        let mut results = [None; BURST_SIZE_MAX];
        ctx.classify_burst(&keys, &mut results[..keys.len()]);

        // Output conversion: scatter hits back to their burst slots.
        let mut hit_mask = 0u64;
        for (res, &p) in results.iter().zip(pos.iter()) {
            if let Some(slot) = *res {
                hit_mask |= 1u64 << p;
                entries[usize::from(p)] = Some(self.entry(slot));
            }
        }

        hit_mask
    }
}

fn valid_mask(n: usize) -> u64 {
    if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }
}

#[cfg(test)]
mod test {
    use super::*;
    use acl_api::AclTableParams;
    use acl_api::FieldDef;
    use acl_api::FieldSchema;
    use acl_api::FieldType;
    use acl_api::FieldValue;

    fn table() -> AclTable {
        let schema = FieldSchema::new(vec![FieldDef {
            field_type: FieldType::Exact,
            offset: 0,
            size: 1,
        }])
        .unwrap();
        AclTable::new(
            AclTableParams { name: "burst".to_string(), n_rules: 8, schema },
            8,
        )
        .unwrap()
    }

    #[test]
    fn empty_table_reports_zero_hits() {
        let t = table();
        let pkts: Vec<&[u8]> = vec![&[0x01], &[0x02]];
        let mut entries = [None; 2];
        assert_eq!(t.lookup(&pkts, 0b11, &mut entries), 0);
        assert_eq!(entries, [None, None]);
    }

    #[test]
    fn sparse_mask_scatters_by_original_position() {
        let mut t = table();
        t.add(&[FieldValue::Exact(0x01)], 0, &[0xaa]).unwrap();
        t.add(&[FieldValue::Exact(0x03)], 0, &[0xcc]).unwrap();

        // Slot 1 is deselected, slot 2 misses, slots 0 and 3 hit.
        let pkts: Vec<&[u8]> = vec![&[0x01], &[0x01], &[0x02], &[0x03]];
        let mut entries: [Option<&[u8]>; 4] = [None; 4];
        let hits = t.lookup(&pkts, 0b1101, &mut entries);

        assert_eq!(hits, 0b1001);
        assert_eq!(entries[0].unwrap()[0], 0xaa);
        assert_eq!(entries[1], None);
        assert_eq!(entries[2], None);
        assert_eq!(entries[3].unwrap()[0], 0xcc);
    }

    #[test]
    fn misses_leave_entries_untouched() {
        let mut t = table();
        t.add(&[FieldValue::Exact(0x01)], 0, &[0xaa]).unwrap();

        let sentinel: &[u8] = &[0xde, 0xad];
        let pkts: Vec<&[u8]> = vec![&[0x7f]];
        let mut entries = [Some(sentinel)];
        assert_eq!(t.lookup(&pkts, 0b1, &mut entries), 0);
        assert_eq!(entries[0], Some(sentinel));
    }

    #[test]
    fn mask_bits_beyond_len_ignored() {
        let mut t = table();
        t.add(&[FieldValue::Exact(0x01)], 0, &[0xaa]).unwrap();

        let pkts: Vec<&[u8]> = vec![&[0x01]];
        let mut entries = [None; 1];
        let hits = t.lookup(&pkts, u64::MAX, &mut entries);
        assert_eq!(hits, 0b1);
    }

    #[test]
    fn full_burst() {
        let mut t = table();
        t.add(&[FieldValue::Exact(0x42)], 0, &[0x42]).unwrap();

        let hit_pkt = [0x42u8];
        let miss_pkt = [0x00u8];
        let pkts: Vec<&[u8]> = (0..BURST_SIZE_MAX)
            .map(|i| {
                if i % 2 == 0 { &hit_pkt[..] } else { &miss_pkt[..] }
            })
            .collect();
        let mut entries = [None; BURST_SIZE_MAX];
        let hits = t.lookup(&pkts, u64::MAX, &mut entries);

        assert_eq!(hits, 0x5555_5555_5555_5555);
        assert_eq!(hits.count_ones(), 32);
        assert_eq!(entries[0].unwrap()[0], 0x42);
        assert_eq!(entries[1], None);
    }
}
