// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use byteorder::{ByteOrder, NativeEndian};
use sapling_arena::Arena;
use sapling_shared::{Error, Result};

use sapling::{SubsystemId, Txn};

use crate::region::Region;
use crate::subsystem::{ThatchEnvState, ThatchTxnState};

/// Allocate a fresh region: a header record in this txn's active list plus
/// its backing page.
pub fn region_new(txn: &mut Txn<'_>) -> Result<u32> {
    txn.require_writable()?;
    let env = txn.env();
    let id = env.with_subsystem_state_mut(SubsystemId::Thatch, |s: &mut ThatchEnvState| {
        let id = s.next_id;
        s.next_id = s
            .next_id
            .checked_add(1)
            .ok_or(Error::Full("thatch region ids"))?;
        Ok(id)
    })?;
    let page = env.with_arena_mut(|arena| {
        arena
            .alloc_page()
            .map_err(|_| Error::Oom("thatch region page"))
    })?;
    txn.with_state_mut(SubsystemId::Thatch, |s: &mut ThatchTxnState| {
        s.regions.push(Region::new(id, page));
        Ok(())
    })?;
    log::trace!("thatch region {id} created");
    Ok(id)
}

/// Run `f` on a region owned by this txn or one of its ancestors. Regions
/// created by an ancestor stay writable from a nested txn; regions already
/// published to the env are sealed and reachable only through readers.
fn with_region_mut<R>(
    txn: &mut Txn<'_>,
    region: u32,
    f: impl FnOnce(&mut Region, &mut Arena) -> Result<R>,
) -> Result<R> {
    let env = txn.env();
    txn.with_state_chain_mut(SubsystemId::Thatch, |chain: &mut [&mut ThatchTxnState]| {
        for state in chain.iter_mut() {
            if let Some(r) = state.regions.iter_mut().find(|r| r.id == region) {
                return env.with_arena_mut(|arena| f(r, arena));
            }
        }
        // A region already published by a committed root txn is sealed;
        // one we have never heard of is absent.
        let published = env.with_subsystem_state(SubsystemId::Thatch, |s: &ThatchEnvState| {
            Ok(s.regions.iter().any(|r| r.id == region))
        })?;
        if published {
            Err(Error::invalid("write to a sealed region"))
        } else {
            Err(Error::NotFound("thatch region"))
        }
    })
}

pub fn write_tag(txn: &mut Txn<'_>, region: u32, tag: u8) -> Result<()> {
    txn.require_writable()?;
    with_region_mut(txn, region, |r, arena| r.append(arena, &[tag]).map(|_| ()))
}

pub fn write_data(txn: &mut Txn<'_>, region: u32, data: &[u8]) -> Result<()> {
    txn.require_writable()?;
    with_region_mut(txn, region, |r, arena| r.append(arena, data).map(|_| ()))
}

/// Reserve a 4-byte slot at the cursor and return its offset; the value is
/// filled in by [`commit_skip`].
pub fn reserve_skip(txn: &mut Txn<'_>, region: u32) -> Result<u32> {
    txn.require_writable()?;
    with_region_mut(txn, region, |r, arena| r.append(arena, &[0u8; 4]))
}

/// Backpatch a reserved slot with the byte count written since the
/// reservation: `head - slot - 4`.
pub fn commit_skip(txn: &mut Txn<'_>, region: u32, slot: u32) -> Result<()> {
    txn.require_writable()?;
    with_region_mut(txn, region, |r, arena| {
        let value = r
            .head
            .checked_sub(slot + 4)
            .ok_or_else(|| Error::range("thatch skip slot", slot as u64, r.head as u64))?;
        r.patch_u32(arena, slot, value)
    })
}

/// The tagged length-prefixed form: `tag u32_len bytes`, written as one
/// unit — either everything lands or nothing does.
pub fn write_tagged_bytes(txn: &mut Txn<'_>, region: u32, tag: u8, bytes: &[u8]) -> Result<()> {
    txn.require_writable()?;
    with_region_mut(txn, region, |r, arena| {
        if r.free_bytes(arena)? < 1 + 4 + bytes.len() {
            return Err(Error::Oom("thatch region page"));
        }
        let mut len = [0u8; 4];
        NativeEndian::write_u32(&mut len, bytes.len() as u32);
        r.append(arena, &[tag])?;
        r.append(arena, &len)?;
        r.append(arena, bytes)?;
        Ok(())
    })
}

/// Mark a region immutable ahead of commit.
pub fn seal(txn: &mut Txn<'_>, region: u32) -> Result<()> {
    txn.require_writable()?;
    with_region_mut(txn, region, |r, _| {
        r.sealed = true;
        Ok(())
    })
}

/// Unlink a region from this txn's active list and free its page. Only
/// regions still on the *current* txn's list can be released.
pub fn region_release(txn: &mut Txn<'_>, region: u32) -> Result<()> {
    txn.require_writable()?;
    let env = txn.env();
    txn.with_state_mut(SubsystemId::Thatch, |s: &mut ThatchTxnState| {
        let at = s
            .regions
            .iter()
            .position(|r| r.id == region)
            .ok_or_else(|| Error::invalid("region is not on this txn's active list"))?;
        let r = s.regions.remove(at);
        env.with_arena_mut(|arena| arena.free_page(r.page))
    })
}
