// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The compiled classification context.
//!
//! [`ClassifierCtx::build`] compiles a snapshot of the active rule set
//! into an immutable decision tree. Internal nodes dispatch on one
//! byte of the packet header region through a 256-way child table;
//! leaves hold their candidate rules ordered by effective priority and
//! verify each candidate with the full field matchers. The dispatch
//! tables are computed from a byte-cover over-approximation of each
//! rule, so walking the tree prunes candidates but never loses a
//! genuine match.
//!
//! A context is never mutated after it is built; the table manager
//! publishes a freshly built context by replacing the old one
//! wholesale.

use crate::rule::FieldMatcher;
use crate::rule::MatchTest;
use acl_api::AclError;
use acl_api::MAX_PRIORITY;
use std::collections::BTreeMap;

type Result<T> = core::result::Result<T, AclError>;

/// Upper bound on tree size. Exceeding it fails the build, which the
/// table manager treats as a transactional failure.
pub(crate) const NODE_BUDGET: usize = 1 << 16;

/// Candidate sets at or below this size are not worth cutting further.
const LEAF_MAX: usize = 4;

/// One active rule, compiled for matching.
#[derive(Clone, Debug)]
pub(crate) struct CompiledRule {
    pub slot: u32,
    /// Inverted priority in the high bits, slot index in the low bits:
    /// the numerically smallest key wins, which yields "highest
    /// requested priority first, lowest slot on ties".
    pub sort_key: u64,
    pub matchers: Vec<FieldMatcher>,
}

impl CompiledRule {
    pub fn new(slot: u32, priority: u32, matchers: Vec<FieldMatcher>) -> Self {
        let inverted = u64::from(MAX_PRIORITY - priority);
        Self { slot, sort_key: inverted << 32 | u64::from(slot), matchers }
    }

    fn is_match(&self, key: &[u8]) -> bool {
        self.matchers.iter().all(|m| m.matches(key))
    }
}

/// A set of byte values, used as the per-rule dispatch cover during
/// the build.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ByteCover([u64; 4]);

impl ByteCover {
    const EMPTY: Self = Self([0; 4]);
    const FULL: Self = Self([u64::MAX; 4]);

    fn single(b: u8) -> Self {
        let mut c = Self::EMPTY;
        c.insert(b);
        c
    }

    fn span(lo: u8, hi: u8) -> Self {
        let mut c = Self::EMPTY;
        for b in lo..=hi {
            c.insert(b);
        }
        c
    }

    fn insert(&mut self, b: u8) {
        self.0[usize::from(b) / 64] |= 1u64 << (usize::from(b) % 64);
    }

    fn contains(&self, b: u8) -> bool {
        self.0[usize::from(b) / 64] & (1u64 << (usize::from(b) % 64)) != 0
    }

    fn is_full(&self) -> bool {
        *self == Self::FULL
    }

    fn intersect(&self, other: &Self) -> Self {
        let mut out = Self::EMPTY;
        for i in 0..4 {
            out.0[i] = self.0[i] & other.0[i];
        }
        out
    }
}

/// The byte values `m` may accept at byte `k` of its field, counting
/// from the most significant byte. Always a superset of the values a
/// matching packet can carry there.
fn matcher_cover(m: &FieldMatcher, k: usize) -> ByteCover {
    let shift = 8 * (m.size - 1 - k);
    let byte_of = |v: u64| ((v >> shift) & 0xff) as u8;

    match m.test {
        MatchTest::Exact(v) => ByteCover::single(byte_of(v)),

        MatchTest::Bitmask { value, mask } => {
            let mb = byte_of(mask);
            let vb = byte_of(value);
            if mb == 0xff {
                return ByteCover::single(vb);
            }

            let mut c = ByteCover::EMPTY;
            for b in 0..=255u8 {
                if b & mb == vb & mb {
                    c.insert(b);
                }
            }
            c
        }

        MatchTest::Range { lo, hi } => {
            // Bytes above the most significant differing byte are
            // fixed; the differing byte itself spans [lo_j, hi_j];
            // everything below may hold any value.
            for j in 0..=k {
                let lj = ((lo >> (8 * (m.size - 1 - j))) & 0xff) as u8;
                let hj = ((hi >> (8 * (m.size - 1 - j))) & 0xff) as u8;
                if j == k {
                    return ByteCover::span(lj, hj);
                }
                if lj != hj {
                    return ByteCover::FULL;
                }
            }
            unreachable!("loop covers j == k");
        }
    }
}

/// The byte values `rule` may accept at absolute header offset `off`.
/// Offsets outside every field are wildcards.
fn cover_at(rule: &CompiledRule, off: usize) -> ByteCover {
    let mut cover = ByteCover::FULL;
    for m in &rule.matchers {
        if off >= m.offset && off < m.offset + m.size {
            cover = cover.intersect(&matcher_cover(m, off - m.offset));
        }
    }
    cover
}

#[derive(Clone, Debug)]
enum Node {
    /// Candidate rule indices, ordered by `sort_key`.
    Leaf(Vec<u32>),
    /// Dispatch on the header byte at `offset`.
    Branch { offset: usize, children: Box<[u32; 256]> },
}

/// An immutable compiled classification structure over one snapshot of
/// the active rule set.
#[derive(Clone, Debug)]
pub struct ClassifierCtx {
    rules: Vec<CompiledRule>,
    nodes: Vec<Node>,
    root: u32,
}

impl ClassifierCtx {
    /// Compile the given active rules. `span` is the number of header
    /// bytes the schema examines. The rule set must be non-empty; a
    /// table with zero active rules publishes no context at all.
    pub(crate) fn build(
        mut rules: Vec<CompiledRule>,
        span: usize,
    ) -> Result<Self> {
        debug_assert!(!rules.is_empty());
        rules.sort_unstable_by_key(|r| r.sort_key);

        let mut tb = TreeBuilder { rules: &rules, nodes: Vec::new() };
        let all = (0..rules.len() as u32).collect();
        let mut used = vec![false; span];
        let root = tb.node(all, &mut used)?;
        let nodes = tb.nodes;

        Ok(Self { rules, nodes, root })
    }

    /// Classify one key: the slot index of the highest-priority
    /// matching rule, or `None` if no rule matches.
    pub fn classify(&self, key: &[u8]) -> Option<u32> {
        let mut id = self.root;
        loop {
            match &self.nodes[id as usize] {
                Node::Branch { offset, children } => {
                    // A key shorter than the examined region
                    // dispatches through byte 0: any rule constraining
                    // this byte cannot match such a key, and leaf
                    // verification rejects it regardless.
                    let b = key.get(*offset).copied().unwrap_or(0);
                    id = children[usize::from(b)];
                }

                Node::Leaf(cands) => {
                    for &i in cands {
                        let r = &self.rules[i as usize];
                        if r.is_match(key) {
                            return Some(r.slot);
                        }
                    }
                    return None;
                }
            }
        }
    }

    /// Classify a dense batch of keys.
    pub fn classify_burst(&self, keys: &[&[u8]], results: &mut [Option<u32>]) {
        for (key, res) in keys.iter().zip(results.iter_mut()) {
            *res = self.classify(key);
        }
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }
}

struct TreeBuilder<'a> {
    rules: &'a [CompiledRule],
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn node(&mut self, cands: Vec<u32>, used: &mut [bool]) -> Result<u32> {
        if cands.len() > LEAF_MAX {
            if let Some((off, covers)) = self.choose_cut(&cands, used) {
                return self.branch(off, cands, covers, used);
            }
        }

        self.push(Node::Leaf(cands))
    }

    /// Pick the unused header byte whose dispatch leaves the largest
    /// child candidate set smallest. `None` when no byte discriminates
    /// among the candidates.
    fn choose_cut(
        &self,
        cands: &[u32],
        used: &[bool],
    ) -> Option<(usize, Vec<ByteCover>)> {
        let mut best: Option<(usize, Vec<ByteCover>, usize)> = None;

        for off in 0..used.len() {
            if used[off] {
                continue;
            }

            let covers: Vec<ByteCover> = cands
                .iter()
                .map(|&i| cover_at(&self.rules[i as usize], off))
                .collect();
            if covers.iter().all(ByteCover::is_full) {
                continue;
            }

            let mut worst = 0;
            for b in 0..=255u8 {
                let n = covers.iter().filter(|c| c.contains(b)).count();
                worst = worst.max(n);
            }

            if best.as_ref().is_none_or(|(_, _, s)| worst < *s) {
                best = Some((off, covers, worst));
            }
        }

        best.map(|(off, covers, _)| (off, covers))
    }

    fn branch(
        &mut self,
        off: usize,
        cands: Vec<u32>,
        covers: Vec<ByteCover>,
        used: &mut [bool],
    ) -> Result<u32> {
        used[off] = true;

        // Children with identical candidate sets share a node.
        let mut shared: BTreeMap<Vec<u32>, u32> = BTreeMap::new();
        let mut children = Box::new([0u32; 256]);

        for b in 0..=255u8 {
            let sub: Vec<u32> = cands
                .iter()
                .zip(covers.iter())
                .filter(|(_, c)| c.contains(b))
                .map(|(&i, _)| i)
                .collect();

            let id = match shared.get(&sub) {
                Some(&id) => id,
                None => {
                    let id = self.node(sub.clone(), used)?;
                    shared.insert(sub, id);
                    id
                }
            };
            children[usize::from(b)] = id;
        }

        used[off] = false;
        self.push(Node::Branch { offset: off, children })
    }

    fn push(&mut self, n: Node) -> Result<u32> {
        if self.nodes.len() >= NODE_BUDGET {
            return Err(AclError::BuildFailed(format!(
                "node budget of {NODE_BUDGET} exhausted",
            )));
        }

        self.nodes.push(n);
        Ok((self.nodes.len() - 1) as u32)
    }
}
