// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use byteorder::{ByteOrder, NativeEndian};
use sapling::{Env, SubsystemId, Txn};
use sapling_arena::PageNo;
use sapling_shared::{Error, Result};

use crate::subsystem::{ThatchEnvState, ThatchTxnState};

/// Zero-copy cursor over a region's written bytes `[0, head)`. Valid for
/// mutable and sealed regions alike; every read is bounds-checked against
/// `head` and overruns answer `Range`.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                Error::range(
                    "thatch cursor",
                    (self.pos as u64).saturating_add(n as u64),
                    self.bytes.len() as u64,
                )
            })?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_tag(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_data(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Read a 4-byte skip/length word (native byte order).
    pub fn read_skip_len(&mut self) -> Result<u32> {
        Ok(NativeEndian::read_u32(self.take(4)?))
    }

    /// The unread remainder, without advancing.
    pub fn read_ptr(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

fn reader_over<R>(
    env: &Env,
    page: PageNo,
    head: u32,
    f: impl FnOnce(&mut Reader<'_>) -> Result<R>,
) -> Result<R> {
    env.with_arena(|arena| {
        let bytes = arena.page(page)?;
        let written = bytes
            .get(..head as usize)
            .ok_or(Error::Corrupt("thatch head beyond its page"))?;
        f(&mut Reader {
            bytes: written,
            pos: 0,
        })
    })
}

/// Read a region visible to this txn: its own and ancestors' active
/// regions first, then regions already published to the environment.
pub fn with_reader<R>(
    txn: &Txn<'_>,
    region: u32,
    f: impl FnOnce(&mut Reader<'_>) -> Result<R>,
) -> Result<R> {
    let env = txn.env();
    let found = txn.with_state_chain(SubsystemId::Thatch, |chain: &[&ThatchTxnState]| {
        for state in chain {
            if let Some(r) = state.regions.iter().find(|r| r.id == region) {
                return Ok(Some((r.page, r.head)));
            }
        }
        Ok(None)
    })?;
    let (page, head) = match found {
        Some(place) => place,
        None => lookup_env(env, region)?,
    };
    reader_over(env, page, head, f)
}

/// Read a region committed by an earlier root txn.
pub fn with_sealed_reader<R>(
    env: &Env,
    region: u32,
    f: impl FnOnce(&mut Reader<'_>) -> Result<R>,
) -> Result<R> {
    let (page, head) = lookup_env(env, region)?;
    reader_over(env, page, head, f)
}

fn lookup_env(env: &Env, region: u32) -> Result<(PageNo, u32)> {
    env.with_subsystem_state(SubsystemId::Thatch, |s: &ThatchEnvState| {
        s.regions
            .iter()
            .find(|r| r.id == region)
            .map(|r| (r.page, r.head))
            .ok_or(Error::NotFound("thatch region"))
    })
}

#[cfg(test)]
mod tests {
    use sapling::{EnvConfig, TxnMode};
    use sapling_shared::ErrorCode;

    use super::*;
    use crate::{
        commit_skip, region_new, region_release, reserve_skip, seal, write_data, write_tag,
        write_tagged_bytes,
    };

    fn env() -> Env {
        let mut env = Env::with_config(&EnvConfig::default()).unwrap();
        crate::init(&mut env).unwrap();
        env
    }

    #[test]
    fn skip_backpatch_counts_bytes_between() {
        let env = env();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();

        write_tag(&mut txn, r, 0x07).unwrap();
        let slot = reserve_skip(&mut txn, r).unwrap();
        write_tag(&mut txn, r, 0x01).unwrap();
        write_tag(&mut txn, r, 0x02).unwrap();
        commit_skip(&mut txn, r, slot).unwrap();

        with_reader(&txn, r, |reader| {
            assert_eq!(reader.read_tag().unwrap(), 0x07);
            assert_eq!(reader.read_skip_len().unwrap(), 2);
            reader.advance(2).unwrap();
            assert!(reader.at_end());
            Ok(())
        })
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn commit_seals_and_publishes() {
        let env = env();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();
        write_data(&mut txn, r, b"packed").unwrap();
        txn.commit().unwrap();

        // Committed: readable through the env, not writable anymore.
        with_sealed_reader(&env, r, |reader| {
            assert_eq!(reader.read_data(6).unwrap(), b"packed");
            Ok(())
        })
        .unwrap();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        assert_eq!(
            write_tag(&mut txn, r, 0xAA).unwrap_err().code(),
            ErrorCode::Invalid
        );
        // Still readable from inside a later txn.
        with_reader(&txn, r, |reader| {
            assert_eq!(reader.read_ptr(), b"packed");
            Ok(())
        })
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn abort_frees_the_page() {
        let env = env();
        let baseline = env.ledger().bytes_in_use();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();
        write_data(&mut txn, r, b"doomed").unwrap();
        txn.abort();
        assert_eq!(env.ledger().bytes_in_use(), baseline);
        assert_eq!(
            with_sealed_reader(&env, r, |_| Ok(())).unwrap_err().code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn sealed_region_rejects_writes_but_reads() {
        let env = env();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();
        write_tag(&mut txn, r, 0x01).unwrap();
        seal(&mut txn, r).unwrap();
        assert_eq!(
            write_tag(&mut txn, r, 0x02).unwrap_err().code(),
            ErrorCode::Invalid
        );
        with_reader(&txn, r, |reader| {
            assert_eq!(reader.read_tag().unwrap(), 0x01);
            Ok(())
        })
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn page_exhaustion_is_oom_and_atomic() {
        let env = {
            let mut env = Env::with_config(&EnvConfig {
                page_size: 16,
                ..EnvConfig::default()
            })
            .unwrap();
            crate::init(&mut env).unwrap();
            env
        };
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();
        write_data(&mut txn, r, &[0xAB; 12]).unwrap();
        assert_eq!(
            write_data(&mut txn, r, &[0xCD; 8]).unwrap_err().code(),
            ErrorCode::Oom
        );
        // Nothing partial landed.
        with_reader(&txn, r, |reader| {
            assert_eq!(reader.remaining(), 12);
            assert_eq!(reader.read_ptr(), &[0xAB; 12]);
            Ok(())
        })
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn tagged_bytes_layout() {
        let env = env();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();
        write_tagged_bytes(&mut txn, r, 0x0C, b"hello").unwrap();
        with_reader(&txn, r, |reader| {
            assert_eq!(reader.read_tag().unwrap(), 0x0C);
            let len = reader.read_skip_len().unwrap() as usize;
            assert_eq!(reader.read_data(len).unwrap(), b"hello");
            assert!(reader.at_end());
            Ok(())
        })
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn release_requires_current_list() {
        let env = env();
        let baseline = env.ledger().bytes_in_use();
        let mut root = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut root).unwrap();
        {
            let mut child = root.begin_nested(TxnMode::ReadWrite).unwrap();
            // The region belongs to the parent, not the child.
            assert_eq!(
                region_release(&mut child, r).unwrap_err().code(),
                ErrorCode::Invalid
            );
            // But it is writable from the child.
            write_tag(&mut child, r, 0x33).unwrap();
            child.commit().unwrap();
        }
        region_release(&mut root, r).unwrap();
        root.commit().unwrap();
        assert_eq!(env.ledger().bytes_in_use(), baseline);
    }

    #[test]
    fn nested_commit_splices_then_parent_abort_frees() {
        let env = env();
        let baseline = env.ledger().bytes_in_use();
        let mut root = env.begin(TxnMode::ReadWrite).unwrap();
        let r = {
            let mut child = root.begin_nested(TxnMode::ReadWrite).unwrap();
            let r = region_new(&mut child).unwrap();
            write_data(&mut child, r, b"nested").unwrap();
            child.commit().unwrap();
            r
        };
        // Spliced onto the root's list, sealed, still readable there.
        with_reader(&root, r, |reader| {
            assert_eq!(reader.read_ptr(), b"nested");
            Ok(())
        })
        .unwrap();
        root.abort();
        assert_eq!(env.ledger().bytes_in_use(), baseline);
    }

    #[test]
    fn cursor_overrun_is_range() {
        let env = env();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();
        write_tag(&mut txn, r, 0x01).unwrap();
        with_reader(&txn, r, |reader| {
            assert_eq!(reader.read_data(2).unwrap_err().code(), ErrorCode::Range);
            assert_eq!(reader.read_skip_len().unwrap_err().code(), ErrorCode::Range);
            reader.read_tag().unwrap();
            assert_eq!(reader.read_tag().unwrap_err().code(), ErrorCode::Range);
            Ok(())
        })
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn skip_slot_must_precede_head() {
        let env = env();
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let r = region_new(&mut txn).unwrap();
        let slot = reserve_skip(&mut txn, r).unwrap();
        commit_skip(&mut txn, r, slot).unwrap();
        // A slot at or past head has no four reserved bytes under it.
        assert_eq!(
            commit_skip(&mut txn, r, slot + 4).unwrap_err().code(),
            ErrorCode::Range
        );
        txn.commit().unwrap();
    }
}
