// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use sapling::{SubsystemId, Txn};
use sapling_arena::{Arena, NodeNo};
use sapling_shared::{Error, Result};

use crate::node::{read_node, write_node, BeptNode};
use crate::subsystem::BeptTxnState;

/// Behavior flags for [`put`]. Undefined bits are rejected.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PutFlags(u32);

impl PutFlags {
    pub const NONE: PutFlags = PutFlags(0);
    /// Fail with `Exists` instead of overwriting a present key.
    pub const NO_OVERWRITE: PutFlags = PutFlags(1);

    pub fn bits(self) -> u32 {
        self.0
    }

    fn validate(self) -> Result<()> {
        if self.0 & !Self::NO_OVERWRITE.0 != 0 {
            return Err(Error::invalid("undefined put flag bits"));
        }
        Ok(())
    }

    fn no_overwrite(self) -> bool {
        self.0 & Self::NO_OVERWRITE.0 != 0
    }
}

impl std::ops::BitOr for PutFlags {
    type Output = PutFlags;
    fn bitor(self, rhs: PutFlags) -> PutFlags {
        PutFlags(self.0 | rhs.0)
    }
}

/// A key word beyond the stored length reads as zero.
fn word_at(key: &[u32], w: usize) -> u32 {
    key.get(w).copied().unwrap_or(0)
}

/// Bit `bit` of the key, counting from the MSB of word 0.
fn check_bit(key: &[u32], bit: u32) -> u32 {
    (word_at(key, (bit / 32) as usize) >> (31 - bit % 32)) & 1
}

/// First bit index where the zero-extended keys differ. `None` means the
/// keys are equal (possibly with different stored lengths).
fn first_diff_bit(a: &[u32], b: &[u32]) -> Option<u32> {
    for w in 0..a.len().max(b.len()) {
        let x = word_at(a, w) ^ word_at(b, w);
        if x != 0 {
            return Some(w as u32 * 32 + x.leading_zeros());
        }
    }
    None
}

/// Descend by the query key's bits to the candidate leaf.
fn find_leaf(arena: &Arena, mut id: NodeNo, key: &[u32]) -> Result<NodeNo> {
    loop {
        match read_node(arena, id)? {
            BeptNode::Internal { bit, left, right } => {
                id = if check_bit(key, bit) == 1 { right } else { left };
            }
            BeptNode::Leaf { .. } => return Ok(id),
        }
    }
}

/// Insert or overwrite `key`. The rebuild writes a fresh path of arena
/// nodes and records the ones it displaces; a failed insert unwinds its
/// own allocations and leaves the draft root untouched.
pub fn put(txn: &mut Txn<'_>, key: &[u32], value: &[u8], flags: PutFlags) -> Result<()> {
    flags.validate()?;
    txn.require_writable()?;
    if key.is_empty() {
        return Err(Error::invalid("bept key must have at least one word"));
    }
    let env = txn.env();
    txn.with_state_mut(SubsystemId::Bept, |st: &mut BeptTxnState| {
        env.with_arena_mut(|arena| {
            let allocated_mark = st.allocated.len();
            let displaced_mark = st.displaced.len();
            let res = put_inner(st, arena, key, value, flags);
            if res.is_err() {
                unwind(st, arena, allocated_mark, displaced_mark);
            }
            res
        })
    })
}

fn put_inner(
    st: &mut BeptTxnState,
    arena: &mut Arena,
    key: &[u32],
    value: &[u8],
    flags: PutFlags,
) -> Result<()> {
    let Some(root) = st.root else {
        let leaf = alloc_leaf(st, arena, key, value)?;
        st.root = Some(leaf);
        return Ok(());
    };
    let candidate = find_leaf(arena, root, key)?;
    let diff = match read_node(arena, candidate)? {
        BeptNode::Leaf { key: leaf_key, .. } => first_diff_bit(key, &leaf_key),
        BeptNode::Internal { .. } => {
            return Err(Error::Corrupt("bept descent ended at an internal node"))
        }
    };
    match diff {
        None => {
            if flags.no_overwrite() {
                return Err(Error::Exists);
            }
            let new_leaf = alloc_leaf(st, arena, key, value)?;
            let new_root = replace_path(st, arena, root, key, new_leaf)?;
            st.root = Some(new_root);
        }
        Some(crit) => {
            let new_leaf = alloc_leaf(st, arena, key, value)?;
            let new_root = insert_path(st, arena, root, key, crit, new_leaf)?;
            st.root = Some(new_root);
        }
    }
    Ok(())
}

fn alloc_leaf(
    st: &mut BeptTxnState,
    arena: &mut Arena,
    key: &[u32],
    value: &[u8],
) -> Result<NodeNo> {
    let id = write_node(
        arena,
        &BeptNode::Leaf {
            key: key.to_vec().into_boxed_slice(),
            value: value.to_vec().into_boxed_slice(),
        },
    )?;
    st.allocated.push(id);
    Ok(id)
}

fn alloc_internal(
    st: &mut BeptTxnState,
    arena: &mut Arena,
    bit: u32,
    left: NodeNo,
    right: NodeNo,
) -> Result<NodeNo> {
    let id = write_node(arena, &BeptNode::Internal { bit, left, right })?;
    st.allocated.push(id);
    Ok(id)
}

enum Step {
    Leaf,
    Descend { bit: u32, left: NodeNo, right: NodeNo },
}

fn step_of(arena: &Arena, id: NodeNo) -> Result<Step> {
    Ok(match read_node(arena, id)? {
        BeptNode::Leaf { .. } => Step::Leaf,
        BeptNode::Internal { bit, left, right } => Step::Descend { bit, left, right },
    })
}

/// Path copy down to the leaf equal to `key`, ending in `new_leaf`.
fn replace_path(
    st: &mut BeptTxnState,
    arena: &mut Arena,
    node_id: NodeNo,
    key: &[u32],
    new_leaf: NodeNo,
) -> Result<NodeNo> {
    match step_of(arena, node_id)? {
        Step::Leaf => {
            st.displaced.push(node_id);
            Ok(new_leaf)
        }
        Step::Descend { bit, left, right } => {
            let go_right = check_bit(key, bit) == 1;
            let child = if go_right { right } else { left };
            let new_child = replace_path(st, arena, child, key, new_leaf)?;
            st.displaced.push(node_id);
            if go_right {
                alloc_internal(st, arena, bit, left, new_child)
            } else {
                alloc_internal(st, arena, bit, new_child, right)
            }
        }
    }
}

/// Path copy that splices a new internal node at the crit bit. The branch
/// is inserted before the first node testing a bit at or past `crit`;
/// every key already below that point carries the candidate leaf's value
/// of the crit bit, so the old subtree goes whole onto the other side.
fn insert_path(
    st: &mut BeptTxnState,
    arena: &mut Arena,
    node_id: NodeNo,
    key: &[u32],
    crit: u32,
    new_leaf: NodeNo,
) -> Result<NodeNo> {
    let descend = match step_of(arena, node_id)? {
        Step::Descend { bit, left, right } if bit < crit => Some((bit, left, right)),
        _ => None,
    };
    match descend {
        Some((bit, left, right)) => {
            let go_right = check_bit(key, bit) == 1;
            let child = if go_right { right } else { left };
            let new_child = insert_path(st, arena, child, key, crit, new_leaf)?;
            st.displaced.push(node_id);
            if go_right {
                alloc_internal(st, arena, bit, left, new_child)
            } else {
                alloc_internal(st, arena, bit, new_child, right)
            }
        }
        None => {
            if check_bit(key, crit) == 1 {
                alloc_internal(st, arena, crit, node_id, new_leaf)
            } else {
                alloc_internal(st, arena, crit, new_leaf, node_id)
            }
        }
    }
}

/// Undo a failed mutation: free the nodes it allocated and forget the
/// displacements it recorded, so the old path stays intact for the commit.
fn unwind(
    st: &mut BeptTxnState,
    arena: &mut Arena,
    allocated_mark: usize,
    displaced_mark: usize,
) {
    st.displaced.truncate(displaced_mark);
    while st.allocated.len() > allocated_mark {
        let id = st.allocated.pop().expect("bounded by mark");
        if let Err(e) = arena.free_node(id) {
            log::error!("bept unwind failed to free a node: {e}");
        }
    }
}

/// Look up a key. Absent keys are `Ok(None)`.
pub fn get(txn: &Txn<'_>, key: &[u32]) -> Result<Option<Vec<u8>>> {
    let env = txn.env();
    txn.with_state(SubsystemId::Bept, |st: &BeptTxnState| {
        env.with_arena(|arena| {
            let Some(root) = st.root else {
                return Ok(None);
            };
            let candidate = find_leaf(arena, root, key)?;
            match read_node(arena, candidate)? {
                BeptNode::Leaf {
                    key: leaf_key,
                    value,
                } => {
                    if first_diff_bit(key, &leaf_key).is_none() {
                        Ok(Some(value.into_vec()))
                    } else {
                        Ok(None)
                    }
                }
                BeptNode::Internal { .. } => {
                    Err(Error::Corrupt("bept descent ended at an internal node"))
                }
            }
        })
    })
}

/// Delete a key, returning the old value. Absent keys are `Ok(None)`.
pub fn del(txn: &mut Txn<'_>, key: &[u32]) -> Result<Option<Vec<u8>>> {
    txn.require_writable()?;
    let old = get(txn, key)?;
    if old.is_none() {
        return Ok(None);
    }
    let env = txn.env();
    txn.with_state_mut(SubsystemId::Bept, |st: &mut BeptTxnState| {
        env.with_arena_mut(|arena| {
            let allocated_mark = st.allocated.len();
            let displaced_mark = st.displaced.len();
            let root = st.root.ok_or(Error::Corrupt("bept root vanished"))?;
            match del_path(st, arena, root, key) {
                Ok(replacement) => {
                    st.root = replacement;
                    Ok(())
                }
                Err(e) => {
                    unwind(st, arena, allocated_mark, displaced_mark);
                    Err(e)
                }
            }
        })
    })?;
    Ok(old)
}

/// Path copy removing the leaf equal to `key`; the match leaf's sibling is
/// promoted into its parent's place. Returns the replacement subtree (None
/// when the removed leaf was the whole tree). The key is known present.
fn del_path(
    st: &mut BeptTxnState,
    arena: &mut Arena,
    node_id: NodeNo,
    key: &[u32],
) -> Result<Option<NodeNo>> {
    match step_of(arena, node_id)? {
        Step::Leaf => {
            st.displaced.push(node_id);
            Ok(None)
        }
        Step::Descend { bit, left, right } => {
            let go_right = check_bit(key, bit) == 1;
            let (child, sibling) = if go_right { (right, left) } else { (left, right) };
            match del_path(st, arena, child, key)? {
                None => {
                    st.displaced.push(node_id);
                    Ok(Some(sibling))
                }
                Some(new_child) => {
                    st.displaced.push(node_id);
                    let id = if go_right {
                        alloc_internal(st, arena, bit, left, new_child)?
                    } else {
                        alloc_internal(st, arena, bit, new_child, right)?
                    };
                    Ok(Some(id))
                }
            }
        }
    }
}

/// The lexicographically least entry: the leftmost leaf.
pub fn min(txn: &Txn<'_>) -> Result<Option<(Vec<u32>, Vec<u8>)>> {
    let env = txn.env();
    txn.with_state(SubsystemId::Bept, |st: &BeptTxnState| {
        env.with_arena(|arena| {
            let Some(mut id) = st.root else {
                return Ok(None);
            };
            loop {
                match read_node(arena, id)? {
                    BeptNode::Internal { left, .. } => id = left,
                    BeptNode::Leaf { key, value } => {
                        return Ok(Some((key.into_vec(), value.into_vec())));
                    }
                }
            }
        })
    })
}

/// In-order traversal, ascending key order.
pub fn for_each(
    txn: &Txn<'_>,
    mut f: impl FnMut(&[u32], &[u8]) -> Result<()>,
) -> Result<()> {
    let env = txn.env();
    txn.with_state(SubsystemId::Bept, |st: &BeptTxnState| {
        env.with_arena(|arena| {
            let Some(root) = st.root else {
                return Ok(());
            };
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                match read_node(arena, id)? {
                    BeptNode::Internal { left, right, .. } => {
                        stack.push(right);
                        stack.push(left);
                    }
                    BeptNode::Leaf { key, value } => {
                        f(&key, &value)?;
                    }
                }
            }
            Ok(())
        })
    })
}
