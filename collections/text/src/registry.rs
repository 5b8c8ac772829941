// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicU32, Ordering};

use sapling::Env;
use sapling_shared::{Error, Result};

use crate::Text;

/// Ids carry a 2-bit tag when stored in a handle, so the id space is 30 bits.
const MAX_IDS: usize = 1 << 30;

struct RegistryEntry {
    refs: AtomicU32,
    text: Text,
}

/// Append-only id → Text map with atomic per-entry refcounts.
///
/// Registration is the single-writer path (`&mut self`); `get`, `retain`
/// and `release` are lock-free and may race freely across threads — the
/// refcount is the registry's only concurrent datum, manipulated with
/// acquire/release ordering so a count that reached zero is never observed
/// as live. A released entry's id is retired permanently; its sequence
/// nodes return to the arena when [`TreeRegistry::free`] runs on the env's
/// thread, since arena access cannot cross threads and freeing under
/// `&self` would take a lock this structure does not have.
#[derive(Default)]
pub struct TreeRegistry {
    entries: Vec<RegistryEntry>,
}

impl TreeRegistry {
    pub fn new() -> TreeRegistry {
        TreeRegistry::default()
    }

    /// Release every held text. Entries shared with live `Text` handles
    /// elsewhere survive until their last holder frees them.
    pub fn free(self, env: &Env) -> Result<()> {
        for entry in self.entries {
            entry.text.free(env)?;
        }
        Ok(())
    }

    /// Store a COW clone of the text. The refcount starts at one.
    pub fn register(&mut self, text: &Text) -> Result<u32> {
        if self.entries.len() >= MAX_IDS {
            return Err(Error::Full("tree id space"));
        }
        let id = self.entries.len() as u32;
        self.entries.push(RegistryEntry {
            refs: AtomicU32::new(1),
            text: text.clone(),
        });
        Ok(id)
    }

    fn entry(&self, id: u32) -> Result<&RegistryEntry> {
        self.entries
            .get(id as usize)
            .ok_or_else(|| Error::range("tree id", id as u64, self.entries.len() as u64))
    }

    /// A shared handle to the registered text; `Invalid` once released.
    pub fn get(&self, id: u32) -> Result<Text> {
        let entry = self.entry(id)?;
        if entry.refs.load(Ordering::Acquire) == 0 {
            return Err(Error::invalid("tree entry already released"));
        }
        Ok(entry.text.clone())
    }

    pub fn retain(&self, id: u32) -> Result<()> {
        let entry = self.entry(id)?;
        entry
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs == 0 {
                    // Released entries never come back.
                    None
                } else {
                    refs.checked_add(1)
                }
            })
            .map_err(|stuck| {
                if stuck == 0 {
                    Error::invalid("tree entry already released")
                } else {
                    Error::Full("tree entry refcount")
                }
            })?;
        Ok(())
    }

    /// Drop one reference. Reaching zero retires the id.
    pub fn release(&self, id: u32) -> Result<()> {
        let entry = self.entry(id)?;
        entry
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                refs.checked_sub(1)
            })
            .map_err(|_| Error::invalid("tree entry already released"))?;
        Ok(())
    }

    /// Entries registered and not yet released to zero.
    pub fn live(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.refs.load(Ordering::Acquire) > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use sapling::{EnvConfig, TxnMode};
    use sapling_shared::ErrorCode;

    use super::*;

    fn env() -> Env {
        let mut env = Env::with_config(&EnvConfig::default()).unwrap();
        sapling_seq::init(&mut env).unwrap();
        env
    }

    fn text_of(env: &Env, s: &str) -> Text {
        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let mut t = Text::new(env).unwrap();
        t.from_utf8(&mut txn, s.as_bytes()).unwrap();
        txn.commit().unwrap();
        t
    }

    #[test]
    fn register_bumps_the_cow_refcount() {
        let env = env();
        let t = text_of(&env, "shared");
        let mut reg = TreeRegistry::new();
        let id = reg.register(&t).unwrap();
        assert_eq!(t.ref_count(), 2);
        let got = reg.get(id).unwrap();
        assert_eq!(got.to_utf8(&env).unwrap(), b"shared");
        assert_eq!(t.ref_count(), 3);
        got.free(&env).unwrap();
        t.free(&env).unwrap();
        reg.free(&env).unwrap();
    }

    #[test]
    fn registered_text_is_isolated_from_later_writes() {
        let env = env();
        let mut t = text_of(&env, "original");
        let mut reg = TreeRegistry::new();
        let id = reg.register(&t).unwrap();

        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        t.push_back(&mut txn, '!').unwrap();
        txn.commit().unwrap();

        assert_eq!(reg.get(id).unwrap().to_utf8(&env).unwrap(), b"original");
        t.free(&env).unwrap();
        reg.free(&env).unwrap();
    }

    #[test]
    fn retain_release_pairs_are_neutral() {
        let env = env();
        let t = text_of(&env, "x");
        let reg = {
            let mut reg = TreeRegistry::new();
            reg.register(&t).unwrap();
            reg
        };
        reg.retain(0).unwrap();
        reg.release(0).unwrap();
        assert!(reg.get(0).is_ok());
        assert_eq!(reg.live(), 1);

        // The registration reference itself.
        reg.release(0).unwrap();
        assert_eq!(reg.live(), 0);
        assert_eq!(reg.get(0).unwrap_err().code(), ErrorCode::Invalid);
        assert_eq!(reg.retain(0).unwrap_err().code(), ErrorCode::Invalid);
        // Underflow guard.
        assert_eq!(reg.release(0).unwrap_err().code(), ErrorCode::Invalid);
        t.free(&env).unwrap();
        reg.free(&env).unwrap();
    }

    #[test]
    fn unknown_id_is_range() {
        let reg = TreeRegistry::new();
        assert_eq!(reg.get(5).unwrap_err().code(), ErrorCode::Range);
        assert_eq!(reg.retain(5).unwrap_err().code(), ErrorCode::Range);
    }

    #[test]
    fn free_returns_held_node_bytes() {
        let env = env();
        let baseline = env.ledger().bytes_in_use();
        let t = text_of(&env, "registered bytes");
        let mut reg = TreeRegistry::new();
        reg.register(&t).unwrap();
        // The caller's handle goes first; the registry still holds one.
        t.free(&env).unwrap();
        assert!(env.ledger().bytes_in_use() > baseline);
        reg.free(&env).unwrap();
        assert_eq!(env.ledger().bytes_in_use(), baseline);
    }

    #[test]
    fn refcounts_race_safely_across_threads() {
        let env = env();
        let t = text_of(&env, "contended");
        let mut reg = TreeRegistry::new();
        let id = reg.register(&t).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        reg.retain(id).unwrap();
                        let text = reg.get(id).unwrap();
                        assert_eq!(text.len(), 9);
                        reg.release(id).unwrap();
                    }
                });
            }
        });
        // All pairs balanced: only the registration ref remains.
        reg.release(id).unwrap();
        assert_eq!(reg.live(), 0);
        t.free(&env).unwrap();
        reg.free(&env).unwrap();
    }
}
