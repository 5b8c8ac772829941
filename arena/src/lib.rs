// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The single linear-memory pool behind a Sapling environment.
//!
//! An [`Arena`] manages two id-addressed populations: fixed-size *pages*
//! (recycled through a LIFO free list) and variable-size *nodes* (ids are
//! never reused). Both draw from one [`MemoryLedger`], the byte budget that
//! also accounts for collection elements living outside the arena proper,
//! so a single capacity bounds the whole environment.

mod arena;
mod backing;
mod ledger;

pub use self::arena::{Arena, ArenaStats, NodeNo, PageNo};
pub use self::backing::ArenaBacking;
pub use self::ledger::{MemoryLedger, PageBuf};

/// Default page size, in bytes, when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
