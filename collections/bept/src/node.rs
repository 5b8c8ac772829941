// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Trie node codec. Every Internal and Leaf lives in an arena node, so a
//! node link is a `NodeNo` and the arena's abort/commit accounting covers
//! the whole tree.
//!
//! Layouts (u32 words in native byte order):
//! - Internal: `tag=0, bit, left, right` — 16 bytes.
//! - Leaf: `tag=1, nwords, val_len, key words…, value bytes…`.

use byteorder::{ByteOrder, NativeEndian};
use sapling_arena::{Arena, NodeNo};
use sapling_shared::{Error, Result};

const TAG_INTERNAL: u32 = 0;
const TAG_LEAF: u32 = 1;

const INTERNAL_BYTES: usize = 16;
const LEAF_HEADER_BYTES: usize = 12;

/// Decoded form of one trie node.
#[derive(Debug)]
pub(crate) enum BeptNode {
    Internal {
        bit: u32,
        left: NodeNo,
        right: NodeNo,
    },
    Leaf {
        key: Box<[u32]>,
        value: Box<[u8]>,
    },
}

/// Encode a node into a fresh arena node.
pub(crate) fn write_node(arena: &mut Arena, node: &BeptNode) -> Result<NodeNo> {
    match node {
        BeptNode::Internal { bit, left, right } => {
            let id = arena
                .alloc_node(INTERNAL_BYTES)
                .map_err(|_| Error::Oom("bept internal node"))?;
            let bytes = arena.node_mut(id)?;
            NativeEndian::write_u32(&mut bytes[0..4], TAG_INTERNAL);
            NativeEndian::write_u32(&mut bytes[4..8], *bit);
            NativeEndian::write_u32(&mut bytes[8..12], left.0);
            NativeEndian::write_u32(&mut bytes[12..16], right.0);
            Ok(id)
        }
        BeptNode::Leaf { key, value } => {
            let size = LEAF_HEADER_BYTES + key.len() * 4 + value.len();
            let id = arena
                .alloc_node(size)
                .map_err(|_| Error::Oom("bept leaf node"))?;
            let bytes = arena.node_mut(id)?;
            NativeEndian::write_u32(&mut bytes[0..4], TAG_LEAF);
            NativeEndian::write_u32(&mut bytes[4..8], key.len() as u32);
            NativeEndian::write_u32(&mut bytes[8..12], value.len() as u32);
            let mut at = LEAF_HEADER_BYTES;
            for &word in key.iter() {
                NativeEndian::write_u32(&mut bytes[at..at + 4], word);
                at += 4;
            }
            bytes[at..at + value.len()].copy_from_slice(value);
            Ok(id)
        }
    }
}

pub(crate) fn read_node(arena: &Arena, id: NodeNo) -> Result<BeptNode> {
    let bytes = arena.node(id)?;
    if bytes.len() < 4 {
        return Err(Error::Corrupt("bept node too small"));
    }
    match NativeEndian::read_u32(&bytes[0..4]) {
        TAG_INTERNAL => {
            if bytes.len() < INTERNAL_BYTES {
                return Err(Error::Corrupt("bept internal node too small"));
            }
            Ok(BeptNode::Internal {
                bit: NativeEndian::read_u32(&bytes[4..8]),
                left: NodeNo(NativeEndian::read_u32(&bytes[8..12])),
                right: NodeNo(NativeEndian::read_u32(&bytes[12..16])),
            })
        }
        TAG_LEAF => {
            if bytes.len() < LEAF_HEADER_BYTES {
                return Err(Error::Corrupt("bept leaf node too small"));
            }
            let nwords = NativeEndian::read_u32(&bytes[4..8]) as usize;
            let val_len = NativeEndian::read_u32(&bytes[8..12]) as usize;
            let key_end = LEAF_HEADER_BYTES + nwords * 4;
            if bytes.len() < key_end + val_len {
                return Err(Error::Corrupt("bept leaf lengths exceed its node"));
            }
            let key = (0..nwords)
                .map(|w| NativeEndian::read_u32(&bytes[LEAF_HEADER_BYTES + 4 * w..]))
                .collect();
            let value = bytes[key_end..key_end + val_len].to_vec().into_boxed_slice();
            Ok(BeptNode::Leaf { key, value })
        }
        _ => Err(Error::Corrupt("bept node tag")),
    }
}
