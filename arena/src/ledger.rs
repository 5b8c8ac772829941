// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sapling_shared::{Error, Result};

/// Byte budget shared by everything in one environment.
///
/// Charges are checked against an optional capacity; a failed charge leaves
/// the ledger untouched so the caller observes no state change. The counter
/// is atomic because ledger-charged buffers ([`PageBuf`]) may be dropped on
/// threads other than the environment's writer.
#[derive(Debug)]
pub struct MemoryLedger {
    capacity: Option<usize>,
    in_use: AtomicUsize,
}

impl MemoryLedger {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Consume budget, or fail with `Full` leaving usage unchanged.
    pub fn charge(&self, bytes: usize) -> Result<()> {
        let res = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let next = cur.checked_add(bytes)?;
                match self.capacity {
                    Some(cap) if next > cap => None,
                    _ => Some(next),
                }
            });
        match res {
            Ok(_) => Ok(()),
            Err(cur) => {
                log::trace!(
                    "ledger charge of {} bytes refused (in use {}, capacity {:?})",
                    bytes,
                    cur,
                    self.capacity
                );
                Err(Error::Full("arena budget"))
            }
        }
    }

    /// Return budget. Refunding more than was charged indicates a
    /// bookkeeping bug; usage saturates at zero rather than wrapping.
    pub fn refund(&self, bytes: usize) {
        let res = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
        debug_assert!(res.is_ok());
    }

    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// A zeroed, ledger-charged byte buffer that owns its own storage and
/// refunds the ledger when dropped. Used where bytes must stay readable
/// without reaching back into the environment, e.g. a sealed literal table
/// shared across threads.
#[derive(Debug)]
pub struct PageBuf {
    bytes: Box<[u8]>,
    ledger: Arc<MemoryLedger>,
}

impl PageBuf {
    pub fn alloc(ledger: &Arc<MemoryLedger>, size: usize) -> Result<PageBuf> {
        ledger.charge(size)?;
        Ok(PageBuf {
            bytes: vec![0u8; size].into_boxed_slice(),
            ledger: ledger.clone(),
        })
    }
}

impl Deref for PageBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        self.ledger.refund(self.bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapling_shared::ErrorCode;

    #[test]
    fn charge_and_refund() {
        let l = MemoryLedger::new(Some(100));
        l.charge(60).unwrap();
        l.charge(40).unwrap();
        assert_eq!(l.bytes_in_use(), 100);
        assert_eq!(l.charge(1).unwrap_err().code(), ErrorCode::Full);
        // A refused charge changes nothing.
        assert_eq!(l.bytes_in_use(), 100);
        l.refund(100);
        assert_eq!(l.bytes_in_use(), 0);
    }

    #[test]
    fn uncapped_ledger_accepts_everything() {
        let l = MemoryLedger::new(None);
        l.charge(usize::MAX / 2).unwrap();
        assert_eq!(l.bytes_in_use(), usize::MAX / 2);
    }

    #[test]
    fn pagebuf_refunds_on_drop() {
        let l = Arc::new(MemoryLedger::new(Some(64)));
        let buf = PageBuf::alloc(&l, 64).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(PageBuf::alloc(&l, 1).unwrap_err().code(), ErrorCode::Full);
        drop(buf);
        assert_eq!(l.bytes_in_use(), 0);
        PageBuf::alloc(&l, 64).unwrap();
    }
}
