// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

/// How an arena's linear memory is provided.
///
/// All four variants are recognized configuration; this build implements
/// `Malloc` and `Linear` as process-heap backings bounded by the memory
/// ledger. `Mmap` and `WasiFd` are honoured by host-runtime adapters and
/// are rejected at construction here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backing", rename_all = "snake_case")]
pub enum ArenaBacking {
    /// Growable process-heap backing, optionally capped.
    Malloc { max_bytes: Option<usize> },
    /// Linear region semantics: `initial` bytes reserved up front, hard cap
    /// at `max`.
    Linear { initial: usize, max: usize },
    /// File-backed mapping owned by a host adapter.
    Mmap { fd: i32, max_bytes: usize },
    /// Preopened-descriptor backing owned by the wasi adapter.
    WasiFd,
}

impl Default for ArenaBacking {
    fn default() -> Self {
        ArenaBacking::Malloc { max_bytes: None }
    }
}

impl ArenaBacking {
    /// The byte capacity this backing imposes, if any.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            ArenaBacking::Malloc { max_bytes } => *max_bytes,
            ArenaBacking::Linear { max, .. } => Some(*max),
            ArenaBacking::Mmap { max_bytes, .. } => Some(*max_bytes),
            ArenaBacking::WasiFd => None,
        }
    }
}
