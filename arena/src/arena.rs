// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use sapling_shared::{Error, Result};

use crate::{ArenaBacking, MemoryLedger};

/// Id of a fixed-size arena page. Freed pages are recycled LIFO, so a held
/// `PageNo` is only meaningful while its allocation is live.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct PageNo(pub u32);

/// Id of a variable-size arena node. Node ids are assigned monotonically
/// and never reused; resolving a freed id fails rather than aliasing.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct NodeNo(pub u32);

/// Point-in-time usage counters, in the spirit of blockstore tracking
/// stats: cheap to read, handy in tests and logs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ArenaStats {
    pub pages_live: usize,
    pub pages_reusable: usize,
    pub nodes_live: usize,
    pub bytes_in_use: usize,
}

/// The arena: one ledger, two id-addressed populations.
///
/// Allocation failure is fully reversible — a refused charge leaves no
/// trace. All returned memory is zeroed.
#[derive(Debug)]
pub struct Arena {
    page_size: usize,
    ledger: Arc<MemoryLedger>,
    pages: Vec<Option<Box<[u8]>>>,
    free_pages: Vec<u32>,
    nodes: Vec<Option<Box<[u8]>>>,
    nodes_live: usize,
}

impl Arena {
    pub fn new(backing: ArenaBacking, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::invalid("arena page size must be nonzero"));
        }
        let reserve_slots = match &backing {
            ArenaBacking::Malloc { .. } => 0,
            ArenaBacking::Linear { initial, max } => {
                if initial > max {
                    return Err(Error::invalid("linear backing: initial exceeds max"));
                }
                initial / page_size
            }
            ArenaBacking::Mmap { .. } => {
                return Err(Error::invalid("mmap backing requires a host adapter"));
            }
            ArenaBacking::WasiFd => {
                return Err(Error::invalid("wasi_fd backing requires the wasi adapter"));
            }
        };
        let ledger = Arc::new(MemoryLedger::new(backing.capacity()));
        let mut pages = Vec::new();
        pages.reserve(reserve_slots);
        Ok(Arena {
            page_size,
            ledger,
            pages,
            free_pages: Vec::new(),
            nodes: Vec::new(),
            nodes_live: 0,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// Allocate a zeroed page, recycling a freed page number if one exists.
    pub fn alloc_page(&mut self) -> Result<PageNo> {
        self.ledger.charge(self.page_size)?;
        let bytes = vec![0u8; self.page_size].into_boxed_slice();
        match self.free_pages.pop() {
            Some(pgno) => {
                self.pages[pgno as usize] = Some(bytes);
                Ok(PageNo(pgno))
            }
            None => {
                if self.pages.len() > u32::MAX as usize {
                    self.ledger.refund(self.page_size);
                    return Err(Error::Full("arena page ids"));
                }
                let pgno = self.pages.len() as u32;
                self.pages.push(Some(bytes));
                Ok(PageNo(pgno))
            }
        }
    }

    /// Release a page; its number goes on the LIFO free list.
    pub fn free_page(&mut self, pgno: PageNo) -> Result<()> {
        let slot = self
            .pages
            .get_mut(pgno.0 as usize)
            .ok_or_else(|| Error::invalid("unknown page id"))?;
        if slot.take().is_none() {
            return Err(Error::invalid("page already freed"));
        }
        self.ledger.refund(self.page_size);
        self.free_pages.push(pgno.0);
        Ok(())
    }

    pub fn page(&self, pgno: PageNo) -> Result<&[u8]> {
        self.pages
            .get(pgno.0 as usize)
            .and_then(|s| s.as_deref())
            .ok_or_else(|| Error::invalid("resolve of dead page id"))
    }

    pub fn page_mut(&mut self, pgno: PageNo) -> Result<&mut [u8]> {
        self.pages
            .get_mut(pgno.0 as usize)
            .and_then(|s| s.as_deref_mut())
            .ok_or_else(|| Error::invalid("resolve of dead page id"))
    }

    /// Allocate a zeroed node of at least `size` bytes.
    pub fn alloc_node(&mut self, size: usize) -> Result<NodeNo> {
        if self.nodes.len() > u32::MAX as usize {
            return Err(Error::Full("arena node ids"));
        }
        self.ledger.charge(size)?;
        let nodeno = self.nodes.len() as u32;
        self.nodes.push(Some(vec![0u8; size].into_boxed_slice()));
        self.nodes_live += 1;
        Ok(NodeNo(nodeno))
    }

    /// Release a node. The id is retired, not recycled.
    pub fn free_node(&mut self, nodeno: NodeNo) -> Result<()> {
        let slot = self
            .nodes
            .get_mut(nodeno.0 as usize)
            .ok_or_else(|| Error::invalid("unknown node id"))?;
        match slot.take() {
            Some(bytes) => {
                self.ledger.refund(bytes.len());
                self.nodes_live -= 1;
                Ok(())
            }
            None => Err(Error::invalid("node already freed")),
        }
    }

    pub fn node(&self, nodeno: NodeNo) -> Result<&[u8]> {
        self.nodes
            .get(nodeno.0 as usize)
            .and_then(|s| s.as_deref())
            .ok_or_else(|| Error::invalid("resolve of dead node id"))
    }

    pub fn node_mut(&mut self, nodeno: NodeNo) -> Result<&mut [u8]> {
        self.nodes
            .get_mut(nodeno.0 as usize)
            .and_then(|s| s.as_deref_mut())
            .ok_or_else(|| Error::invalid("resolve of dead node id"))
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            pages_live: self.pages.iter().filter(|p| p.is_some()).count(),
            pages_reusable: self.free_pages.len(),
            nodes_live: self.nodes_live,
            bytes_in_use: self.ledger.bytes_in_use(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapling_shared::ErrorCode;

    fn small_arena() -> Arena {
        Arena::new(
            ArenaBacking::Linear {
                initial: 0,
                max: 256,
            },
            64,
        )
        .unwrap()
    }

    #[test]
    fn pages_recycle_lifo() {
        let mut a = small_arena();
        let p0 = a.alloc_page().unwrap();
        let p1 = a.alloc_page().unwrap();
        assert_eq!((p0, p1), (PageNo(0), PageNo(1)));

        a.free_page(p0).unwrap();
        a.free_page(p1).unwrap();
        // LIFO: the most recently freed number comes back first.
        assert_eq!(a.alloc_page().unwrap(), PageNo(1));
        assert_eq!(a.alloc_page().unwrap(), PageNo(0));
    }

    #[test]
    fn recycled_pages_come_back_zeroed() {
        let mut a = small_arena();
        let p = a.alloc_page().unwrap();
        a.page_mut(p).unwrap().fill(0xAB);
        a.free_page(p).unwrap();
        let p = a.alloc_page().unwrap();
        assert!(a.page(p).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn capacity_exhaustion_is_full_and_reversible() {
        let mut a = small_arena();
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(a.alloc_page().unwrap());
        }
        let before = a.stats();
        assert_eq!(a.alloc_page().unwrap_err().code(), ErrorCode::Full);
        assert_eq!(a.stats(), before);
        a.free_page(held.pop().unwrap()).unwrap();
        a.alloc_page().unwrap();
    }

    #[test]
    fn node_ids_are_not_recycled() {
        let mut a = small_arena();
        let n0 = a.alloc_node(16).unwrap();
        a.free_node(n0).unwrap();
        let n1 = a.alloc_node(16).unwrap();
        assert_ne!(n0, n1);
        assert_eq!(a.node(n0).unwrap_err().code(), ErrorCode::Invalid);
        assert_eq!(a.node(n1).unwrap().len(), 16);
    }

    #[test]
    fn double_free_is_invalid() {
        let mut a = small_arena();
        let p = a.alloc_page().unwrap();
        a.free_page(p).unwrap();
        assert_eq!(a.free_page(p).unwrap_err().code(), ErrorCode::Invalid);

        let n = a.alloc_node(8).unwrap();
        a.free_node(n).unwrap();
        assert_eq!(a.free_node(n).unwrap_err().code(), ErrorCode::Invalid);
    }

    #[test]
    fn unsupported_backings_rejected() {
        for backing in [
            ArenaBacking::Mmap {
                fd: 3,
                max_bytes: 1 << 20,
            },
            ArenaBacking::WasiFd,
        ] {
            assert_eq!(
                Arena::new(backing, 4096).unwrap_err().code(),
                ErrorCode::Invalid
            );
        }
    }
}
