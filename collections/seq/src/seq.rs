// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use sapling::{Env, SubsystemId, Txn};
use sapling_arena::{MemoryLedger, NodeNo};
use sapling_shared::{Error, ErrorCode, Result};

use crate::subsystem::SeqTxnState;
use crate::tree::{self, TreeNode};

/// A sequence of 32-bit element handles.
///
/// The tree lives in the environment's arena: a `Seq` holds only the root
/// level's `NodeNo` and a cached length, so reads resolve through the env
/// and mutators through a read-write [`Txn`]. A mutator that fails with
/// `Oom` may have stopped mid-rebalance and *poisons* the sequence: until
/// [`Seq::reset`] succeeds, every further mutator answers `Invalid`.
/// Reads stay usable on a poisoned sequence.
///
/// Dropping a `Seq` without [`Seq::free`] strands its nodes until the
/// environment is destroyed; the arena owns them either way.
#[derive(Debug)]
pub struct Seq {
    root: NodeNo,
    len: usize,
    ledger: Arc<MemoryLedger>,
    poisoned: bool,
}

impl Seq {
    pub fn new(env: &Env) -> Result<Seq> {
        if !env.has_subsystem(SubsystemId::Seq) {
            return Err(Error::invalid("seq subsystem not registered"));
        }
        let root = env.with_arena_mut(|arena| tree::new_tree(arena, &TreeNode::Empty))?;
        Ok(Seq {
            root,
            len: 0,
            ledger: env.ledger().clone(),
            poisoned: false,
        })
    }

    /// Release every node of this sequence back to the arena.
    pub fn free(self, env: &Env) -> Result<()> {
        self.check_env(env)?;
        env.with_arena_mut(|arena| tree::free_tree(arena, self.root, 0))
    }

    /// Deep copy through fresh arena nodes. A failed copy frees whatever
    /// it had allocated and leaves the source untouched and unpoisoned.
    pub fn try_clone(&self, txn: &Txn<'_>) -> Result<Seq> {
        Self::check_registered(txn)?;
        let env = txn.env();
        self.check_env(env)?;
        self.check_valid()?;
        let root = self.root;
        let copy = env.with_arena_mut(|arena| {
            let mut fresh = Vec::new();
            match tree::clone_tree(arena, root, 0, &mut fresh) {
                Ok(copy) => Ok(copy),
                Err(e) => {
                    for id in fresh.into_iter().rev() {
                        if let Err(free_err) = arena.free_node(id) {
                            log::error!("seq clone unwind: {free_err}");
                        }
                    }
                    Err(e)
                }
            }
        })?;
        Ok(Seq {
            root: copy,
            len: self.len,
            ledger: self.ledger.clone(),
            poisoned: false,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// False after a mutator failed with `Oom`, until `reset` succeeds.
    pub fn is_valid(&self) -> bool {
        !self.poisoned
    }

    pub fn get(&self, env: &Env, i: usize) -> Result<u32> {
        self.check_env(env)?;
        if i >= self.len {
            return Err(Error::range("seq", i as u64, self.len as u64));
        }
        env.with_arena(|arena| tree::get(arena, self.root, i as u32, 0))
    }

    /// All elements, left to right. The arena borrow is scoped to the
    /// call, so the result can be walked without holding the env.
    pub fn to_vec(&self, env: &Env) -> Result<Vec<u32>> {
        self.check_env(env)?;
        let mut out = Vec::with_capacity(self.len);
        env.with_arena(|arena| tree::collect(arena, self.root, 0, &mut out))?;
        Ok(out)
    }

    /// In-order element walk.
    pub fn for_each(&self, env: &Env, mut f: impl FnMut(u32) -> Result<()>) -> Result<()> {
        for v in self.to_vec(env)? {
            f(v)?;
        }
        Ok(())
    }

    pub fn push_front(&mut self, txn: &mut Txn<'_>, value: u32) -> Result<()> {
        self.mutate_guard(txn)?;
        let root = self.root;
        let res = txn.with_arena_mut(|arena| tree::push_front(arena, root, value, 1, 0));
        self.absorb(res)?;
        self.len += 1;
        Ok(())
    }

    pub fn push_back(&mut self, txn: &mut Txn<'_>, value: u32) -> Result<()> {
        self.mutate_guard(txn)?;
        let root = self.root;
        let res = txn.with_arena_mut(|arena| tree::push_back(arena, root, value, 1, 0));
        self.absorb(res)?;
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self, txn: &mut Txn<'_>) -> Result<u32> {
        self.mutate_guard(txn)?;
        let root = self.root;
        let res = txn.with_arena_mut(|arena| tree::pop_front(arena, root, 0));
        match self.absorb(res)? {
            Some(v) => {
                self.len -= 1;
                Ok(v)
            }
            None => Err(Error::Empty("seq")),
        }
    }

    pub fn pop_back(&mut self, txn: &mut Txn<'_>) -> Result<u32> {
        self.mutate_guard(txn)?;
        let root = self.root;
        let res = txn.with_arena_mut(|arena| tree::pop_back(arena, root, 0));
        match self.absorb(res)? {
            Some(v) => {
                self.len -= 1;
                Ok(v)
            }
            None => Err(Error::Empty("seq")),
        }
    }

    /// dest ++= src, leaving `src` empty. Self-concat cannot be expressed:
    /// the two `&mut` receivers may not alias. An `Oom` mid-merge poisons
    /// both sequences.
    pub fn concat(&mut self, txn: &mut Txn<'_>, src: &mut Seq) -> Result<()> {
        self.mutate_guard(txn)?;
        src.check_env(txn.env())?;
        src.check_valid()?;
        let (left, right) = (self.root, src.root);
        let res = txn.with_arena_mut(|arena| {
            // Allocated first so a refused allocation changes nothing.
            let fresh = tree::new_tree(arena, &TreeNode::Empty)?;
            match tree::concat(arena, left, right, 0) {
                Ok(merged) => Ok((merged, fresh)),
                Err(e) => {
                    let _ = arena.free_node(fresh);
                    Err(e)
                }
            }
        });
        match res {
            Ok((merged, fresh)) => {
                self.root = merged;
                self.len += src.len;
                src.root = fresh;
                src.len = 0;
                Ok(())
            }
            Err(e) => {
                if e.code() == ErrorCode::Oom {
                    self.poisoned = true;
                    src.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Split into `([0, i), [i, len))`, leaving this sequence empty. An
    /// `Oom` mid-split poisons this sequence; the out values are untouched.
    pub fn split_at(&mut self, txn: &mut Txn<'_>, i: usize) -> Result<(Seq, Seq)> {
        self.mutate_guard(txn)?;
        if i > self.len {
            return Err(Error::range("seq split", i as u64, self.len as u64));
        }
        let root = self.root;
        let res = txn.with_arena_mut(|arena| {
            let fresh = tree::new_tree(arena, &TreeNode::Empty)?;
            match tree::split(arena, root, i as u32) {
                Ok(halves) => Ok((halves, fresh)),
                Err(e) => {
                    let _ = arena.free_node(fresh);
                    Err(e)
                }
            }
        });
        let ((left, right), fresh) = self.absorb(res)?;
        let total = self.len;
        self.root = fresh;
        self.len = 0;
        Ok((self.successor(left, i), self.successor(right, total - i)))
    }

    /// Empty the sequence and clear the poison flag. The root node is kept
    /// and blanked, so reset itself never needs an allocation.
    pub fn reset(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        Self::check_registered(txn)?;
        txn.require_writable()?;
        self.check_env(txn.env())?;
        let root = self.root;
        txn.with_arena_mut(|arena| tree::reset_root(arena, root))?;
        self.len = 0;
        self.poisoned = false;
        Ok(())
    }

    /// A sequence adopting `root` and its already-counted elements.
    fn successor(&self, root: NodeNo, len: usize) -> Seq {
        Seq {
            root,
            len,
            ledger: self.ledger.clone(),
            poisoned: false,
        }
    }

    /// Poison on `Oom`: the rebalance may have stopped half-done.
    fn absorb<T>(&mut self, res: Result<T>) -> Result<T> {
        match res {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.code() == ErrorCode::Oom {
                    log::trace!("seq mutation refused by arena: {e}");
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    fn mutate_guard(&self, txn: &mut Txn<'_>) -> Result<()> {
        Self::check_registered(txn)?;
        txn.require_writable()?;
        self.check_env(txn.env())?;
        self.check_valid()
    }

    fn check_valid(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::invalid("poisoned sequence"));
        }
        Ok(())
    }

    /// Node ids are only meaningful in the arena they came from.
    fn check_env(&self, env: &Env) -> Result<()> {
        if !Arc::ptr_eq(&self.ledger, env.ledger()) {
            return Err(Error::invalid("seq used with a foreign environment"));
        }
        Ok(())
    }

    fn check_registered(txn: &Txn<'_>) -> Result<()> {
        txn.with_state(SubsystemId::Seq, |_: &SeqTxnState| Ok(()))
    }
}
