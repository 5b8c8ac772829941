// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use byteorder::{ByteOrder, NativeEndian};
use sapling_arena::{Arena, PageNo};
use sapling_shared::{Error, Result};

/// A region record: one arena page, a bump cursor, and the seal flag.
/// Mutable while owned by an open transaction; sealed at commit.
#[derive(Debug)]
pub(crate) struct Region {
    pub(crate) id: u32,
    pub(crate) page: PageNo,
    pub(crate) head: u32,
    pub(crate) sealed: bool,
}

impl Region {
    pub(crate) fn new(id: u32, page: PageNo) -> Region {
        Region {
            id,
            page,
            head: 0,
            sealed: false,
        }
    }

    fn writable_page<'a>(&self, arena: &'a mut Arena) -> Result<&'a mut [u8]> {
        if self.sealed {
            return Err(Error::invalid("write to a sealed region"));
        }
        arena.page_mut(self.page)
    }

    /// Append bytes at the cursor. A single page bounds the region;
    /// exhausting it is `Oom`, and a refused write changes nothing.
    pub(crate) fn append(&mut self, arena: &mut Arena, bytes: &[u8]) -> Result<u32> {
        let page = self.writable_page(arena)?;
        let head = self.head as usize;
        if head + bytes.len() > page.len() {
            return Err(Error::Oom("thatch region page"));
        }
        page[head..head + bytes.len()].copy_from_slice(bytes);
        let at = self.head;
        self.head += bytes.len() as u32;
        Ok(at)
    }

    pub(crate) fn free_bytes(&self, arena: &Arena) -> Result<usize> {
        Ok(arena.page(self.page)?.len() - self.head as usize)
    }

    /// Backpatch a previously written 4-byte slot.
    pub(crate) fn patch_u32(&mut self, arena: &mut Arena, slot: u32, value: u32) -> Result<()> {
        if slot + 4 > self.head {
            return Err(Error::range("thatch skip slot", slot as u64, self.head as u64));
        }
        let page = self.writable_page(arena)?;
        NativeEndian::write_u32(&mut page[slot as usize..slot as usize + 4], value);
        Ok(())
    }
}
