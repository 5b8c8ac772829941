// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The 2-3 finger tree underneath [`crate::Seq`], stored entirely in arena
//! nodes.
//!
//! Every structural piece is a `NodeNo`-addressed byte region: one *tree
//! node* per spine level (Empty / Single / Deep with its digits and a link
//! to the next level) and one *spine node* per 2-3 grouping. Digit slots
//! hold 32-bit items: at depth zero an item is the element value itself,
//! deeper down it is the `NodeNo` of a spine node one level below. No
//! structural link is a host pointer, so the whole graph survives as
//! integer ids in linear memory.
//!
//! Shape invariants: a deep level carries digits of 1..=4 items per side,
//! every spine node has 2 or 3 children, and every tree and spine node
//! caches the number of elements below it.

use byteorder::{ByteOrder, NativeEndian};
use sapling_arena::{Arena, NodeNo};
use sapling_shared::{Error, Result};

/// Fixed size of a tree (level) node. Levels mutate in place through every
/// tag transition, so the node is allocated at the widest layout:
/// `tag, size, front_len, back_len, mid, front[4], back[4]`.
const TREE_BYTES: usize = 52;

/// Fixed size of a spine node: `size, arity, kids[3]`.
const SPINE_BYTES: usize = 20;

const TAG_EMPTY: u32 = 0;
const TAG_SINGLE: u32 = 1;
const TAG_DEEP: u32 = 2;

const OFF_TAG: usize = 0;
const OFF_SIZE: usize = 4;
const OFF_FRONT_LEN: usize = 8;
const OFF_BACK_LEN: usize = 12;
const OFF_MID: usize = 16;
const OFF_FRONT: usize = 20;
const OFF_BACK: usize = 36;

const OFF_SPINE_SIZE: usize = 0;
const OFF_SPINE_ARITY: usize = 4;
const OFF_SPINE_KIDS: usize = 8;

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    NativeEndian::read_u32(&bytes[off..off + 4])
}

fn put_u32(bytes: &mut [u8], off: usize, v: u32) {
    NativeEndian::write_u32(&mut bytes[off..off + 4], v);
}

/// Decoded form of one level node, used only transiently between a read
/// and the write that follows it.
#[derive(Clone, Debug)]
pub(crate) enum TreeNode {
    Empty,
    Single {
        item: u32,
        size: u32,
    },
    Deep {
        size: u32,
        front: Vec<u32>,
        mid: NodeNo,
        back: Vec<u32>,
    },
}

pub(crate) fn new_tree(arena: &mut Arena, node: &TreeNode) -> Result<NodeNo> {
    let id = arena
        .alloc_node(TREE_BYTES)
        .map_err(|_| Error::Oom("seq tree node"))?;
    write_tree(arena, id, node)?;
    Ok(id)
}

pub(crate) fn read_tree(arena: &Arena, id: NodeNo) -> Result<TreeNode> {
    let bytes = arena.node(id)?;
    if bytes.len() < TREE_BYTES {
        return Err(Error::Corrupt("seq tree node too small"));
    }
    match u32_at(bytes, OFF_TAG) {
        TAG_EMPTY => Ok(TreeNode::Empty),
        TAG_SINGLE => Ok(TreeNode::Single {
            item: u32_at(bytes, OFF_FRONT),
            size: u32_at(bytes, OFF_SIZE),
        }),
        TAG_DEEP => {
            let front_len = u32_at(bytes, OFF_FRONT_LEN) as usize;
            let back_len = u32_at(bytes, OFF_BACK_LEN) as usize;
            if !(1..=4).contains(&front_len) || !(1..=4).contains(&back_len) {
                return Err(Error::Corrupt("seq digit length"));
            }
            let front = (0..front_len)
                .map(|k| u32_at(bytes, OFF_FRONT + 4 * k))
                .collect();
            let back = (0..back_len)
                .map(|k| u32_at(bytes, OFF_BACK + 4 * k))
                .collect();
            Ok(TreeNode::Deep {
                size: u32_at(bytes, OFF_SIZE),
                front,
                mid: NodeNo(u32_at(bytes, OFF_MID)),
                back,
            })
        }
        _ => Err(Error::Corrupt("seq tree node tag")),
    }
}

pub(crate) fn write_tree(arena: &mut Arena, id: NodeNo, node: &TreeNode) -> Result<()> {
    let bytes = arena.node_mut(id)?;
    if bytes.len() < TREE_BYTES {
        return Err(Error::Corrupt("seq tree node too small"));
    }
    bytes[..TREE_BYTES].fill(0);
    match node {
        TreeNode::Empty => put_u32(bytes, OFF_TAG, TAG_EMPTY),
        TreeNode::Single { item, size } => {
            put_u32(bytes, OFF_TAG, TAG_SINGLE);
            put_u32(bytes, OFF_SIZE, *size);
            put_u32(bytes, OFF_FRONT, *item);
        }
        TreeNode::Deep {
            size,
            front,
            mid,
            back,
        } => {
            debug_assert!((1..=4).contains(&front.len()));
            debug_assert!((1..=4).contains(&back.len()));
            put_u32(bytes, OFF_TAG, TAG_DEEP);
            put_u32(bytes, OFF_SIZE, *size);
            put_u32(bytes, OFF_FRONT_LEN, front.len() as u32);
            put_u32(bytes, OFF_BACK_LEN, back.len() as u32);
            put_u32(bytes, OFF_MID, mid.0);
            for (k, item) in front.iter().enumerate() {
                put_u32(bytes, OFF_FRONT + 4 * k, *item);
            }
            for (k, item) in back.iter().enumerate() {
                put_u32(bytes, OFF_BACK + 4 * k, *item);
            }
        }
    }
    Ok(())
}

fn new_spine(arena: &mut Arena, size: u32, kids: &[u32]) -> Result<NodeNo> {
    debug_assert!((2..=3).contains(&kids.len()));
    let id = arena
        .alloc_node(SPINE_BYTES)
        .map_err(|_| Error::Oom("seq spine node"))?;
    let bytes = arena.node_mut(id)?;
    put_u32(bytes, OFF_SPINE_SIZE, size);
    put_u32(bytes, OFF_SPINE_ARITY, kids.len() as u32);
    for (k, kid) in kids.iter().enumerate() {
        put_u32(bytes, OFF_SPINE_KIDS + 4 * k, *kid);
    }
    Ok(id)
}

fn read_spine(arena: &Arena, id: NodeNo) -> Result<(u32, Vec<u32>)> {
    let bytes = arena.node(id)?;
    if bytes.len() < SPINE_BYTES {
        return Err(Error::Corrupt("seq spine node too small"));
    }
    let arity = u32_at(bytes, OFF_SPINE_ARITY) as usize;
    if !(2..=3).contains(&arity) {
        return Err(Error::Corrupt("seq spine arity"));
    }
    let kids = (0..arity)
        .map(|k| u32_at(bytes, OFF_SPINE_KIDS + 4 * k))
        .collect();
    Ok((u32_at(bytes, OFF_SPINE_SIZE), kids))
}

/// Element count below one digit item. Depth zero items are elements.
fn item_size(arena: &Arena, item: u32, depth: u32) -> Result<u32> {
    if depth == 0 {
        Ok(1)
    } else {
        Ok(read_spine(arena, NodeNo(item))?.0)
    }
}

fn digit_size(arena: &Arena, items: &[u32], depth: u32) -> Result<u32> {
    let mut total = 0;
    for &item in items {
        total += item_size(arena, item, depth)?;
    }
    Ok(total)
}

/// Cached element count of a tree, O(1).
pub(crate) fn tree_size(arena: &Arena, id: NodeNo) -> Result<u32> {
    Ok(match read_tree(arena, id)? {
        TreeNode::Empty => 0,
        TreeNode::Single { size, .. } => size,
        TreeNode::Deep { size, .. } => size,
    })
}

pub(crate) fn push_front(
    arena: &mut Arena,
    id: NodeNo,
    item: u32,
    item_sz: u32,
    depth: u32,
) -> Result<()> {
    match read_tree(arena, id)? {
        TreeNode::Empty => write_tree(
            arena,
            id,
            &TreeNode::Single {
                item,
                size: item_sz,
            },
        ),
        TreeNode::Single { item: b, size } => {
            let mid = new_tree(arena, &TreeNode::Empty)?;
            write_tree(
                arena,
                id,
                &TreeNode::Deep {
                    size: item_sz + size,
                    front: vec![item],
                    mid,
                    back: vec![b],
                },
            )
        }
        TreeNode::Deep {
            size,
            mut front,
            mid,
            back,
        } => {
            if front.len() == 4 {
                // [a,b,c,d] + new e: keep [e,a], sink node3(b,c,d).
                let spill = [front[1], front[2], front[3]];
                let spill_size = digit_size(arena, &spill, depth)?;
                let spine = new_spine(arena, spill_size, &spill)?;
                push_front(arena, mid, spine.0, spill_size, depth + 1)?;
                front = vec![item, front[0]];
            } else {
                front.insert(0, item);
            }
            write_tree(
                arena,
                id,
                &TreeNode::Deep {
                    size: size + item_sz,
                    front,
                    mid,
                    back,
                },
            )
        }
    }
}

pub(crate) fn push_back(
    arena: &mut Arena,
    id: NodeNo,
    item: u32,
    item_sz: u32,
    depth: u32,
) -> Result<()> {
    match read_tree(arena, id)? {
        TreeNode::Empty => write_tree(
            arena,
            id,
            &TreeNode::Single {
                item,
                size: item_sz,
            },
        ),
        TreeNode::Single { item: a, size } => {
            let mid = new_tree(arena, &TreeNode::Empty)?;
            write_tree(
                arena,
                id,
                &TreeNode::Deep {
                    size: size + item_sz,
                    front: vec![a],
                    mid,
                    back: vec![item],
                },
            )
        }
        TreeNode::Deep {
            size,
            front,
            mid,
            mut back,
        } => {
            if back.len() == 4 {
                // [a,b,c,d] + new e: sink node3(a,b,c), keep [d,e].
                let spill = [back[0], back[1], back[2]];
                let spill_size = digit_size(arena, &spill, depth)?;
                let spine = new_spine(arena, spill_size, &spill)?;
                push_back(arena, mid, spine.0, spill_size, depth + 1)?;
                back = vec![back[3], item];
            } else {
                back.push(item);
            }
            write_tree(
                arena,
                id,
                &TreeNode::Deep {
                    size: size + item_sz,
                    front,
                    mid,
                    back,
                },
            )
        }
    }
}

pub(crate) fn pop_front(arena: &mut Arena, id: NodeNo, depth: u32) -> Result<Option<u32>> {
    match read_tree(arena, id)? {
        TreeNode::Empty => Ok(None),
        TreeNode::Single { item, .. } => {
            write_tree(arena, id, &TreeNode::Empty)?;
            Ok(Some(item))
        }
        TreeNode::Deep {
            size,
            mut front,
            mid,
            mut back,
        } => {
            let item = front.remove(0);
            let remaining = size - item_size(arena, item, depth)?;
            if front.is_empty() {
                match pop_front(arena, mid, depth + 1)? {
                    Some(spine) => {
                        let (_, kids) = read_spine(arena, NodeNo(spine))?;
                        arena.free_node(NodeNo(spine))?;
                        write_tree(
                            arena,
                            id,
                            &TreeNode::Deep {
                                size: remaining,
                                front: kids,
                                mid,
                                back,
                            },
                        )?;
                    }
                    None => {
                        if back.len() == 1 {
                            arena.free_node(mid)?;
                            write_tree(
                                arena,
                                id,
                                &TreeNode::Single {
                                    item: back[0],
                                    size: remaining,
                                },
                            )?;
                        } else {
                            let first = back.remove(0);
                            write_tree(
                                arena,
                                id,
                                &TreeNode::Deep {
                                    size: remaining,
                                    front: vec![first],
                                    mid,
                                    back,
                                },
                            )?;
                        }
                    }
                }
            } else {
                write_tree(
                    arena,
                    id,
                    &TreeNode::Deep {
                        size: remaining,
                        front,
                        mid,
                        back,
                    },
                )?;
            }
            Ok(Some(item))
        }
    }
}

pub(crate) fn pop_back(arena: &mut Arena, id: NodeNo, depth: u32) -> Result<Option<u32>> {
    match read_tree(arena, id)? {
        TreeNode::Empty => Ok(None),
        TreeNode::Single { item, .. } => {
            write_tree(arena, id, &TreeNode::Empty)?;
            Ok(Some(item))
        }
        TreeNode::Deep {
            size,
            mut front,
            mid,
            mut back,
        } => {
            let item = back.pop().expect("digit is nonempty");
            let remaining = size - item_size(arena, item, depth)?;
            if back.is_empty() {
                match pop_back(arena, mid, depth + 1)? {
                    Some(spine) => {
                        let (_, kids) = read_spine(arena, NodeNo(spine))?;
                        arena.free_node(NodeNo(spine))?;
                        write_tree(
                            arena,
                            id,
                            &TreeNode::Deep {
                                size: remaining,
                                front,
                                mid,
                                back: kids,
                            },
                        )?;
                    }
                    None => {
                        if front.len() == 1 {
                            arena.free_node(mid)?;
                            write_tree(
                                arena,
                                id,
                                &TreeNode::Single {
                                    item: front[0],
                                    size: remaining,
                                },
                            )?;
                        } else {
                            let last = front.pop().expect("digit has two or more items");
                            write_tree(
                                arena,
                                id,
                                &TreeNode::Deep {
                                    size: remaining,
                                    front,
                                    mid,
                                    back: vec![last],
                                },
                            )?;
                        }
                    }
                }
            } else {
                write_tree(
                    arena,
                    id,
                    &TreeNode::Deep {
                        size: remaining,
                        front,
                        mid,
                        back,
                    },
                )?;
            }
            Ok(Some(item))
        }
    }
}

/// Element at index `i`. Precondition: `i < tree_size`.
pub(crate) fn get(arena: &Arena, id: NodeNo, i: u32, depth: u32) -> Result<u32> {
    match read_tree(arena, id)? {
        TreeNode::Empty => Err(Error::Corrupt("seq index beyond tree")),
        TreeNode::Single { item, .. } => item_get(arena, item, i, depth),
        TreeNode::Deep {
            front, mid, back, ..
        } => {
            let mut i = i;
            for &item in &front {
                let s = item_size(arena, item, depth)?;
                if i < s {
                    return item_get(arena, item, i, depth);
                }
                i -= s;
            }
            let ms = tree_size(arena, mid)?;
            if i < ms {
                return get(arena, mid, i, depth + 1);
            }
            i -= ms;
            for &item in &back {
                let s = item_size(arena, item, depth)?;
                if i < s {
                    return item_get(arena, item, i, depth);
                }
                i -= s;
            }
            Err(Error::Corrupt("seq index beyond tree"))
        }
    }
}

fn item_get(arena: &Arena, item: u32, i: u32, depth: u32) -> Result<u32> {
    if depth == 0 {
        debug_assert_eq!(i, 0);
        return Ok(item);
    }
    let (_, kids) = read_spine(arena, NodeNo(item))?;
    let mut i = i;
    for &kid in &kids {
        let s = item_size(arena, kid, depth - 1)?;
        if i < s {
            return item_get(arena, kid, i, depth - 1);
        }
        i -= s;
    }
    Err(Error::Corrupt("seq index beyond spine node"))
}

/// In-order element traversal into `out`.
pub(crate) fn collect(arena: &Arena, id: NodeNo, depth: u32, out: &mut Vec<u32>) -> Result<()> {
    match read_tree(arena, id)? {
        TreeNode::Empty => Ok(()),
        TreeNode::Single { item, .. } => collect_item(arena, item, depth, out),
        TreeNode::Deep {
            front, mid, back, ..
        } => {
            for &item in &front {
                collect_item(arena, item, depth, out)?;
            }
            collect(arena, mid, depth + 1, out)?;
            for &item in &back {
                collect_item(arena, item, depth, out)?;
            }
            Ok(())
        }
    }
}

fn collect_item(arena: &Arena, item: u32, depth: u32, out: &mut Vec<u32>) -> Result<()> {
    if depth == 0 {
        out.push(item);
        return Ok(());
    }
    let (_, kids) = read_spine(arena, NodeNo(item))?;
    for &kid in &kids {
        collect_item(arena, kid, depth - 1, out)?;
    }
    Ok(())
}

/// Free a whole tree, including every spine node and level below it.
pub(crate) fn free_tree(arena: &mut Arena, id: NodeNo, depth: u32) -> Result<()> {
    match read_tree(arena, id)? {
        TreeNode::Empty => {}
        TreeNode::Single { item, .. } => free_item(arena, item, depth)?,
        TreeNode::Deep {
            front, mid, back, ..
        } => {
            for &item in front.iter().chain(back.iter()) {
                free_item(arena, item, depth)?;
            }
            free_tree(arena, mid, depth + 1)?;
        }
    }
    arena.free_node(id)
}

fn free_item(arena: &mut Arena, item: u32, depth: u32) -> Result<()> {
    if depth == 0 {
        return Ok(());
    }
    let (_, kids) = read_spine(arena, NodeNo(item))?;
    for &kid in &kids {
        free_item(arena, kid, depth - 1)?;
    }
    arena.free_node(NodeNo(item))
}

/// Empty a tree in place: free its children but keep (and blank) the root
/// level node. Child-free failures are abandoned rather than propagated so
/// a poisoned sequence can always be reset.
pub(crate) fn reset_root(arena: &mut Arena, id: NodeNo) -> Result<()> {
    let node = read_tree(arena, id)?;
    match node {
        TreeNode::Empty => {}
        TreeNode::Single { item, .. } => {
            if let Err(e) = free_item(arena, item, 0) {
                log::error!("seq reset abandoned an item: {e}");
            }
        }
        TreeNode::Deep {
            front, mid, back, ..
        } => {
            for &item in front.iter().chain(back.iter()) {
                if let Err(e) = free_item(arena, item, 0) {
                    log::error!("seq reset abandoned an item: {e}");
                }
            }
            if let Err(e) = free_tree(arena, mid, 1) {
                log::error!("seq reset abandoned a spine level: {e}");
            }
        }
    }
    write_tree(arena, id, &TreeNode::Empty)
}

/// Deep copy. `fresh` records every allocation so a failed clone can be
/// unwound by the caller without touching the source.
pub(crate) fn clone_tree(
    arena: &mut Arena,
    id: NodeNo,
    depth: u32,
    fresh: &mut Vec<NodeNo>,
) -> Result<NodeNo> {
    let node = match read_tree(arena, id)? {
        TreeNode::Empty => TreeNode::Empty,
        TreeNode::Single { item, size } => TreeNode::Single {
            item: clone_item(arena, item, depth, fresh)?,
            size,
        },
        TreeNode::Deep {
            size,
            front,
            mid,
            back,
        } => {
            let front = clone_items(arena, &front, depth, fresh)?;
            let back = clone_items(arena, &back, depth, fresh)?;
            let mid = clone_tree(arena, mid, depth + 1, fresh)?;
            TreeNode::Deep {
                size,
                front,
                mid,
                back,
            }
        }
    };
    let copy = new_tree(arena, &node)?;
    fresh.push(copy);
    Ok(copy)
}

fn clone_items(
    arena: &mut Arena,
    items: &[u32],
    depth: u32,
    fresh: &mut Vec<NodeNo>,
) -> Result<Vec<u32>> {
    items
        .iter()
        .map(|&item| clone_item(arena, item, depth, fresh))
        .collect()
}

fn clone_item(arena: &mut Arena, item: u32, depth: u32, fresh: &mut Vec<NodeNo>) -> Result<u32> {
    if depth == 0 {
        return Ok(item);
    }
    let (size, kids) = read_spine(arena, NodeNo(item))?;
    let mut copied = Vec::with_capacity(kids.len());
    for &kid in &kids {
        copied.push(clone_item(arena, kid, depth - 1, fresh)?);
    }
    let copy = new_spine(arena, size, &copied)?;
    fresh.push(copy);
    Ok(copy.0)
}

/// left ++ right. Consumes both roots and returns the surviving one; the
/// other level node is freed.
pub(crate) fn concat(arena: &mut Arena, left: NodeNo, right: NodeNo, depth: u32) -> Result<NodeNo> {
    app3(arena, left, Vec::new(), right, depth)
}

/// The classic three-way append: left ++ carry ++ right, where `carry`
/// holds same-level items (at most four from each adjacent digit).
fn app3(
    arena: &mut Arena,
    left: NodeNo,
    carry: Vec<u32>,
    right: NodeNo,
    depth: u32,
) -> Result<NodeNo> {
    let l = read_tree(arena, left)?;
    let r = read_tree(arena, right)?;
    match (l, r) {
        (TreeNode::Empty, _) => {
            arena.free_node(left)?;
            prepend_items(arena, right, &carry, depth)?;
            Ok(right)
        }
        (_, TreeNode::Empty) => {
            arena.free_node(right)?;
            append_items(arena, left, &carry, depth)?;
            Ok(left)
        }
        (TreeNode::Single { item: x, .. }, _) => {
            arena.free_node(left)?;
            prepend_items(arena, right, &carry, depth)?;
            let xs = item_size(arena, x, depth)?;
            push_front(arena, right, x, xs, depth)?;
            Ok(right)
        }
        (_, TreeNode::Single { item: y, .. }) => {
            arena.free_node(right)?;
            append_items(arena, left, &carry, depth)?;
            let ys = item_size(arena, y, depth)?;
            push_back(arena, left, y, ys, depth)?;
            Ok(left)
        }
        (
            TreeNode::Deep {
                size: ls,
                front: lf,
                mid: lm,
                back: lb,
            },
            TreeNode::Deep {
                size: rs,
                front: rf,
                mid: rm,
                back: rb,
            },
        ) => {
            let carry_size = digit_size(arena, &carry, depth)?;
            let mut items = lb;
            items.extend(carry);
            items.extend(rf);
            let packed = pack_spines(arena, items, depth)?;
            let mid = app3(arena, lm, packed, rm, depth + 1)?;
            write_tree(
                arena,
                left,
                &TreeNode::Deep {
                    size: ls + carry_size + rs,
                    front: lf,
                    mid,
                    back: rb,
                },
            )?;
            arena.free_node(right)?;
            Ok(left)
        }
    }
}

fn prepend_items(arena: &mut Arena, id: NodeNo, items: &[u32], depth: u32) -> Result<()> {
    for &item in items.iter().rev() {
        let s = item_size(arena, item, depth)?;
        push_front(arena, id, item, s, depth)?;
    }
    Ok(())
}

fn append_items(arena: &mut Arena, id: NodeNo, items: &[u32], depth: u32) -> Result<()> {
    for &item in items {
        let s = item_size(arena, item, depth)?;
        push_back(arena, id, item, s, depth)?;
    }
    Ok(())
}

/// Group 2..=12 same-level items into freshly allocated 2-3 spine nodes
/// one level up.
fn pack_spines(arena: &mut Arena, items: Vec<u32>, depth: u32) -> Result<Vec<u32>> {
    debug_assert!(items.len() >= 2);
    let mut out = Vec::new();
    let mut rest = items;
    loop {
        let take = match rest.len() {
            2 | 3 => rest.len(),
            4 => 2,
            _ => 3,
        };
        let group: Vec<u32> = rest.drain(..take).collect();
        let size = digit_size(arena, &group, depth)?;
        out.push(new_spine(arena, size, &group)?.0);
        if rest.is_empty() {
            return Ok(out);
        }
    }
}

/// Split into `([0, i), [i, len))`. Consumes the root; both returned roots
/// are valid trees. Precondition: `i <= len`.
pub(crate) fn split(arena: &mut Arena, id: NodeNo, i: u32) -> Result<(NodeNo, NodeNo)> {
    let total = tree_size(arena, id)?;
    debug_assert!(i <= total);
    if i == 0 {
        let empty = new_tree(arena, &TreeNode::Empty)?;
        return Ok((empty, id));
    }
    if i == total {
        let empty = new_tree(arena, &TreeNode::Empty)?;
        return Ok((id, empty));
    }
    let (left, item, right) = split_point(arena, id, i, 0)?;
    // A top-level item is a bare element.
    push_front(arena, right, item, 1, 0)?;
    Ok((left, right))
}

/// Locate the item of this level containing element index `i`. Returns
/// (items before, containing item, items after) as trees of the same
/// level; the input node is reused by one of them. Precondition: i < size.
fn split_point(arena: &mut Arena, id: NodeNo, i: u32, depth: u32) -> Result<(NodeNo, u32, NodeNo)> {
    match read_tree(arena, id)? {
        TreeNode::Empty => Err(Error::Corrupt("seq split in an empty tree")),
        TreeNode::Single { item, .. } => {
            write_tree(arena, id, &TreeNode::Empty)?;
            let right = new_tree(arena, &TreeNode::Empty)?;
            Ok((id, item, right))
        }
        TreeNode::Deep {
            front, mid, back, ..
        } => {
            let fs = digit_size(arena, &front, depth)?;
            if i < fs {
                let (before, item, after) = split_digit(arena, front, i, depth)?;
                let left = tree_from_items(arena, &before, depth)?;
                let right = deep_left(arena, Some(id), after, mid, back, depth)?;
                return Ok((left, item, right));
            }
            let ms = tree_size(arena, mid)?;
            if i < fs + ms {
                let (ml, spine_item, mr) = split_point(arena, mid, i - fs, depth + 1)?;
                let (_, kids) = read_spine(arena, NodeNo(spine_item))?;
                arena.free_node(NodeNo(spine_item))?;
                let ml_size = tree_size(arena, ml)?;
                let (before, item, after) = split_digit(arena, kids, i - fs - ml_size, depth)?;
                let left = deep_right(arena, Some(id), front, ml, before, depth)?;
                let right = deep_left(arena, None, after, mr, back, depth)?;
                return Ok((left, item, right));
            }
            let (before, item, after) = split_digit(arena, back, i - fs - ms, depth)?;
            let left = deep_right(arena, Some(id), front, mid, before, depth)?;
            let right = tree_from_items(arena, &after, depth)?;
            Ok((left, item, right))
        }
    }
}

/// Split a digit at element index `i`, returning the items wholly before,
/// the item containing `i`, and the items wholly after.
fn split_digit(
    arena: &Arena,
    items: Vec<u32>,
    mut i: u32,
    depth: u32,
) -> Result<(Vec<u32>, u32, Vec<u32>)> {
    let mut iter = items.into_iter();
    let mut before = Vec::new();
    while let Some(item) = iter.next() {
        let s = item_size(arena, item, depth)?;
        if i < s {
            return Ok((before, item, iter.collect()));
        }
        i -= s;
        before.push(item);
    }
    Err(Error::Corrupt("seq split index beyond digit"))
}

/// A tree of 0..=3 same-level items, in fresh nodes.
fn tree_from_items(arena: &mut Arena, items: &[u32], depth: u32) -> Result<NodeNo> {
    let id = new_tree(arena, &TreeNode::Empty)?;
    append_items(arena, id, items, depth)?;
    Ok(id)
}

/// Rebuild a deep level whose front digit may have gone empty, into
/// `node` if given or a fresh node otherwise.
fn deep_left(
    arena: &mut Arena,
    node: Option<NodeNo>,
    front: Vec<u32>,
    mid: NodeNo,
    back: Vec<u32>,
    depth: u32,
) -> Result<NodeNo> {
    let id = match node {
        Some(id) => id,
        None => new_tree(arena, &TreeNode::Empty)?,
    };
    if front.is_empty() {
        match pop_front(arena, mid, depth + 1)? {
            Some(spine) => {
                let (_, kids) = read_spine(arena, NodeNo(spine))?;
                arena.free_node(NodeNo(spine))?;
                let size =
                    digit_size(arena, &kids, depth)? + tree_size(arena, mid)? + digit_size(arena, &back, depth)?;
                write_tree(
                    arena,
                    id,
                    &TreeNode::Deep {
                        size,
                        front: kids,
                        mid,
                        back,
                    },
                )?;
            }
            None => {
                rebuild_from_digit(arena, id, mid, back, depth, true)?;
            }
        }
    } else {
        let size = digit_size(arena, &front, depth)?
            + tree_size(arena, mid)?
            + digit_size(arena, &back, depth)?;
        write_tree(
            arena,
            id,
            &TreeNode::Deep {
                size,
                front,
                mid,
                back,
            },
        )?;
    }
    Ok(id)
}

/// Rebuild a deep level whose back digit may have gone empty.
fn deep_right(
    arena: &mut Arena,
    node: Option<NodeNo>,
    front: Vec<u32>,
    mid: NodeNo,
    back: Vec<u32>,
    depth: u32,
) -> Result<NodeNo> {
    let id = match node {
        Some(id) => id,
        None => new_tree(arena, &TreeNode::Empty)?,
    };
    if back.is_empty() {
        match pop_back(arena, mid, depth + 1)? {
            Some(spine) => {
                let (_, kids) = read_spine(arena, NodeNo(spine))?;
                arena.free_node(NodeNo(spine))?;
                let size = digit_size(arena, &front, depth)?
                    + tree_size(arena, mid)?
                    + digit_size(arena, &kids, depth)?;
                write_tree(
                    arena,
                    id,
                    &TreeNode::Deep {
                        size,
                        front,
                        mid,
                        back: kids,
                    },
                )?;
            }
            None => {
                rebuild_from_digit(arena, id, mid, front, depth, false)?;
            }
        }
    } else {
        let size = digit_size(arena, &front, depth)?
            + tree_size(arena, mid)?
            + digit_size(arena, &back, depth)?;
        write_tree(
            arena,
            id,
            &TreeNode::Deep {
                size,
                front,
                mid,
                back,
            },
        )?;
    }
    Ok(id)
}

/// One surviving digit plus an empty mid: collapse to Single (freeing the
/// mid level) or respread the digit across both sides, reusing the mid.
fn rebuild_from_digit(
    arena: &mut Arena,
    id: NodeNo,
    mid: NodeNo,
    mut items: Vec<u32>,
    depth: u32,
    from_back: bool,
) -> Result<()> {
    debug_assert!(!items.is_empty());
    let size = digit_size(arena, &items, depth)?;
    if items.len() == 1 {
        arena.free_node(mid)?;
        write_tree(
            arena,
            id,
            &TreeNode::Single {
                item: items[0],
                size,
            },
        )
    } else if from_back {
        let first = items.remove(0);
        write_tree(
            arena,
            id,
            &TreeNode::Deep {
                size,
                front: vec![first],
                mid,
                back: items,
            },
        )
    } else {
        let last = items.pop().expect("digit has two or more items");
        write_tree(
            arena,
            id,
            &TreeNode::Deep {
                size,
                front: items,
                mid,
                back: vec![last],
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;
    use sapling_arena::ArenaBacking;

    use super::*;

    fn arena() -> Arena {
        Arena::new(ArenaBacking::Malloc { max_bytes: None }, 4096).unwrap()
    }

    /// Deep shape check: digit widths, spine arity, cached sizes, and that
    /// every reachable id resolves. Returns the computed element count.
    fn validate(arena: &Arena, id: NodeNo, depth: u32) -> u32 {
        fn validate_item(arena: &Arena, item: u32, depth: u32) -> u32 {
            if depth == 0 {
                return 1;
            }
            let (size, kids) = read_spine(arena, NodeNo(item)).unwrap();
            assert!((2..=3).contains(&kids.len()), "spine arity");
            let computed: u32 = kids
                .iter()
                .map(|&kid| validate_item(arena, kid, depth - 1))
                .sum();
            assert_eq!(size, computed, "cached spine size");
            computed
        }
        match read_tree(arena, id).unwrap() {
            TreeNode::Empty => 0,
            TreeNode::Single { item, size } => {
                let computed = validate_item(arena, item, depth);
                assert_eq!(size, computed, "cached single size");
                computed
            }
            TreeNode::Deep {
                size,
                front,
                mid,
                back,
            } => {
                assert!((1..=4).contains(&front.len()), "front digit width");
                assert!((1..=4).contains(&back.len()), "back digit width");
                let mut computed = 0;
                for &item in front.iter().chain(back.iter()) {
                    computed += validate_item(arena, item, depth);
                }
                computed += validate(arena, mid, depth + 1);
                assert_eq!(size, computed, "cached deep size");
                computed
            }
        }
    }

    fn drain_front(arena: &mut Arena, id: NodeNo) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(v) = pop_front(arena, id, 0).unwrap() {
            out.push(v);
        }
        out
    }

    fn tree_of(arena: &mut Arena, vals: impl IntoIterator<Item = u32>) -> NodeNo {
        let id = new_tree(arena, &TreeNode::Empty).unwrap();
        for v in vals {
            push_back(arena, id, v, 1, 0).unwrap();
        }
        id
    }

    #[test]
    fn push_pop_both_ends() {
        let mut a = arena();
        let t = new_tree(&mut a, &TreeNode::Empty).unwrap();
        for v in 0..100u32 {
            push_back(&mut a, t, v, 1, 0).unwrap();
            validate(&a, t, 0);
        }
        for v in 100..200u32 {
            push_front(&mut a, t, v, 1, 0).unwrap();
            validate(&a, t, 0);
        }
        assert_eq!(tree_size(&a, t).unwrap(), 200);
        assert_eq!(get(&a, t, 0, 0).unwrap(), 199);
        assert_eq!(get(&a, t, 99, 0).unwrap(), 100);
        assert_eq!(get(&a, t, 100, 0).unwrap(), 0);
        assert_eq!(get(&a, t, 199, 0).unwrap(), 99);

        for want in (100..200).rev() {
            assert_eq!(pop_front(&mut a, t, 0).unwrap(), Some(want));
            validate(&a, t, 0);
        }
        for want in (0..100).rev() {
            assert_eq!(pop_back(&mut a, t, 0).unwrap(), Some(want));
            validate(&a, t, 0);
        }
        assert_eq!(pop_front(&mut a, t, 0).unwrap(), None);
        assert_eq!(pop_back(&mut a, t, 0).unwrap(), None);

        // Every structural node went back to the arena.
        free_tree(&mut a, t, 0).unwrap();
        assert_eq!(a.stats().nodes_live, 0);
        assert_eq!(a.stats().bytes_in_use, 0);
    }

    #[test]
    fn collect_matches_get() {
        let mut a = arena();
        let t = tree_of(&mut a, 0..500);
        validate(&a, t, 0);
        let mut collected = Vec::new();
        collect(&a, t, 0, &mut collected).unwrap();
        assert_eq!(collected.len(), 500);
        for (i, v) in collected.iter().enumerate() {
            assert_eq!(get(&a, t, i as u32, 0).unwrap(), *v);
            assert_eq!(*v, i as u32);
        }
        free_tree(&mut a, t, 0).unwrap();
        assert_eq!(a.stats().nodes_live, 0);
    }

    #[quickcheck]
    fn qc_deque_model(ops: Vec<(bool, bool, u32)>) -> bool {
        use std::collections::VecDeque;
        let mut a = arena();
        let mut model: VecDeque<u32> = VecDeque::new();
        let t = new_tree(&mut a, &TreeNode::Empty).unwrap();
        for (push, at_front, v) in ops {
            match (push, at_front) {
                (true, true) => {
                    push_front(&mut a, t, v, 1, 0).unwrap();
                    model.push_front(v);
                }
                (true, false) => {
                    push_back(&mut a, t, v, 1, 0).unwrap();
                    model.push_back(v);
                }
                (false, true) => {
                    if pop_front(&mut a, t, 0).unwrap() != model.pop_front() {
                        return false;
                    }
                }
                (false, false) => {
                    if pop_back(&mut a, t, 0).unwrap() != model.pop_back() {
                        return false;
                    }
                }
            }
            validate(&a, t, 0);
            if tree_size(&a, t).unwrap() as usize != model.len() {
                return false;
            }
        }
        let mut collected = Vec::new();
        collect(&a, t, 0, &mut collected).unwrap();
        let ok = collected.iter().eq(model.iter());
        free_tree(&mut a, t, 0).unwrap();
        ok && a.stats().nodes_live == 0
    }

    #[quickcheck]
    fn qc_split_concat_round_trip(vals: Vec<u32>, at: usize) -> bool {
        let n = vals.len();
        let i = if n == 0 { 0 } else { at % (n + 1) };
        let mut a = arena();
        let t = tree_of(&mut a, vals.iter().copied());
        let (l, r) = split(&mut a, t, i as u32).unwrap();
        validate(&a, l, 0);
        validate(&a, r, 0);
        if tree_size(&a, l).unwrap() as usize != i || tree_size(&a, r).unwrap() as usize != n - i {
            return false;
        }
        let mut left_vals = Vec::new();
        collect(&a, l, 0, &mut left_vals).unwrap();
        let mut right_vals = Vec::new();
        collect(&a, r, 0, &mut right_vals).unwrap();
        if left_vals != vals[..i] || right_vals != vals[i..] {
            return false;
        }
        let joined = concat(&mut a, l, r, 0).unwrap();
        validate(&a, joined, 0);
        let ok = drain_front(&mut a, joined) == vals;
        free_tree(&mut a, joined, 0).unwrap();
        ok && a.stats().nodes_live == 0
    }

    #[quickcheck]
    fn qc_concat_preserves_order(xs: Vec<u32>, ys: Vec<u32>) -> bool {
        let mut a = arena();
        let l = tree_of(&mut a, xs.iter().copied());
        let r = tree_of(&mut a, ys.iter().copied());
        let joined = concat(&mut a, l, r, 0).unwrap();
        validate(&a, joined, 0);
        let want: Vec<u32> = xs.iter().chain(ys.iter()).copied().collect();
        let mut got = Vec::new();
        collect(&a, joined, 0, &mut got).unwrap();
        free_tree(&mut a, joined, 0).unwrap();
        got == want && a.stats().nodes_live == 0
    }

    #[test]
    fn split_inside_deep_spine() {
        let n = 4096u32;
        for &i in &[0u32, 1, 2, 63, 64, 65, 1000, 2048, 4095, 4096] {
            let mut a = arena();
            let t = tree_of(&mut a, 0..n);
            let (l, r) = split(&mut a, t, i).unwrap();
            validate(&a, l, 0);
            validate(&a, r, 0);
            assert_eq!(tree_size(&a, l).unwrap(), i);
            assert_eq!(tree_size(&a, r).unwrap(), n - i);
            let mut left_vals = Vec::new();
            collect(&a, l, 0, &mut left_vals).unwrap();
            assert!(left_vals.iter().copied().eq(0..i));
            let mut right_vals = Vec::new();
            collect(&a, r, 0, &mut right_vals).unwrap();
            assert!(right_vals.iter().copied().eq(i..n));
            free_tree(&mut a, l, 0).unwrap();
            free_tree(&mut a, r, 0).unwrap();
            assert_eq!(a.stats().nodes_live, 0);
        }
    }

    #[test]
    fn clone_is_structurally_independent() {
        let mut a = arena();
        let t = tree_of(&mut a, 0..300);
        let mut fresh = Vec::new();
        let c = clone_tree(&mut a, t, 0, &mut fresh).unwrap();
        validate(&a, c, 0);
        push_back(&mut a, c, 999, 1, 0).unwrap();
        assert_eq!(tree_size(&a, t).unwrap(), 300);
        assert_eq!(tree_size(&a, c).unwrap(), 301);
        assert_eq!(get(&a, c, 300, 0).unwrap(), 999);
        free_tree(&mut a, t, 0).unwrap();
        free_tree(&mut a, c, 0).unwrap();
        assert_eq!(a.stats().nodes_live, 0);
    }

    #[test]
    fn reset_root_keeps_the_level_node() {
        let mut a = arena();
        let t = tree_of(&mut a, 0..100);
        reset_root(&mut a, t).unwrap();
        assert_eq!(tree_size(&a, t).unwrap(), 0);
        assert_eq!(a.stats().nodes_live, 1);
        push_back(&mut a, t, 5, 1, 0).unwrap();
        assert_eq!(get(&a, t, 0, 0).unwrap(), 5);
        free_tree(&mut a, t, 0).unwrap();
        assert_eq!(a.stats().nodes_live, 0);
    }
}
