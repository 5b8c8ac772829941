// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sapling::Env;
use sapling_arena::{MemoryLedger, PageBuf};
use sapling_shared::{Error, Result};

/// Ids carry a 2-bit tag when stored in a handle, so the id space is 30 bits.
const MAX_IDS: usize = 1 << 30;

/// Probe table load threshold: grow at 75%.
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 4;

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut h = 0x811C_9DC5u32;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    page: u32,
    off: u32,
    len: u32,
}

/// Append-only, content-addressed byte-string table.
///
/// Adding the same bytes twice returns the prior id (FNV-1a over content,
/// open-addressed probing). Bytes live bump-allocated across ledger-charged
/// pages; a string larger than one page gets a dedicated buffer. Sealing
/// forbids further additions — and because the seal flag is
/// Release-stored/Acquire-loaded and the storage is self-owned, a sealed
/// table is safe for lock-free readers on other threads.
pub struct LiteralTable {
    entries: Vec<Entry>,
    index: Vec<u32>,
    pages: Vec<PageBuf>,
    bump: Option<(usize, usize)>,
    page_size: usize,
    ledger: Arc<MemoryLedger>,
    sealed: AtomicBool,
}

impl LiteralTable {
    pub fn new(env: &Env) -> LiteralTable {
        LiteralTable {
            entries: Vec::new(),
            index: Vec::new(),
            pages: Vec::new(),
            bump: None,
            page_size: env.page_size(),
            ledger: env.ledger().clone(),
            sealed: AtomicBool::new(false),
        }
    }

    /// Number of distinct byte strings interned.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Forbid further additions. Once sealed the table may be shared with
    /// concurrent readers.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn get(&self, id: u32) -> Result<&[u8]> {
        let entry = self
            .entries
            .get(id as usize)
            .ok_or_else(|| Error::range("literal id", id as u64, self.entries.len() as u64))?;
        let page = &self.pages[entry.page as usize];
        Ok(&page[entry.off as usize..(entry.off + entry.len) as usize])
    }

    /// Intern a byte string, returning the prior id for duplicate content.
    pub fn add(&mut self, bytes: &[u8]) -> Result<u32> {
        if self.is_sealed() {
            return Err(Error::invalid("literal table is sealed"));
        }
        if let Some(id) = self.lookup(bytes) {
            return Ok(id);
        }
        if self.entries.len() >= MAX_IDS {
            return Err(Error::Full("literal id space"));
        }
        self.ensure_index_capacity()?;
        let entry = self.store(bytes)?;
        let id = self.entries.len() as u32;
        self.entries.push(entry);
        self.index_insert(fnv1a(bytes), id);
        Ok(id)
    }

    fn lookup(&self, bytes: &[u8]) -> Option<u32> {
        if self.index.is_empty() {
            return None;
        }
        let mask = self.index.len() - 1;
        let mut at = fnv1a(bytes) as usize & mask;
        loop {
            match self.index[at] {
                0 => return None,
                slot => {
                    let id = slot - 1;
                    let entry = self.entries[id as usize];
                    let page = &self.pages[entry.page as usize];
                    let stored = &page[entry.off as usize..(entry.off + entry.len) as usize];
                    if stored == bytes {
                        return Some(id);
                    }
                }
            }
            at = (at + 1) & mask;
        }
    }

    fn index_insert(&mut self, hash: u32, id: u32) {
        let mask = self.index.len() - 1;
        let mut at = hash as usize & mask;
        while self.index[at] != 0 {
            at = (at + 1) & mask;
        }
        self.index[at] = id + 1;
    }

    /// Grow the probe table before it crosses 75% load.
    fn ensure_index_capacity(&mut self) -> Result<()> {
        if self.index.is_empty() {
            self.index = vec![0; 16];
            return Ok(());
        }
        if (self.entries.len() + 1) * LOAD_DEN < self.index.len() * LOAD_NUM {
            return Ok(());
        }
        let grown = self.index.len() * 2;
        self.index = vec![0; grown];
        for id in 0..self.entries.len() as u32 {
            let hash = fnv1a(self.get(id).expect("entry id in range"));
            self.index_insert(hash, id);
        }
        Ok(())
    }

    /// Place the bytes: bump-allocated within the current page, or in a
    /// dedicated buffer for oversized strings.
    fn store(&mut self, bytes: &[u8]) -> Result<Entry> {
        if bytes.len() > self.page_size {
            let mut page = PageBuf::alloc(&self.ledger, bytes.len())
                .map_err(|_| Error::Oom("literal storage"))?;
            page[..bytes.len()].copy_from_slice(bytes);
            let page_idx = self.pages.len() as u32;
            self.pages.push(page);
            return Ok(Entry {
                page: page_idx,
                off: 0,
                len: bytes.len() as u32,
            });
        }
        let fits = matches!(self.bump, Some((_, used)) if used + bytes.len() <= self.page_size);
        if !fits {
            let page = PageBuf::alloc(&self.ledger, self.page_size)
                .map_err(|_| Error::Oom("literal storage"))?;
            self.bump = Some((self.pages.len(), 0));
            self.pages.push(page);
        }
        let (page_idx, used) = self.bump.expect("bump page ensured above");
        self.pages[page_idx][used..used + bytes.len()].copy_from_slice(bytes);
        self.bump = Some((page_idx, used + bytes.len()));
        Ok(Entry {
            page: page_idx as u32,
            off: used as u32,
            len: bytes.len() as u32,
        })
    }
}
