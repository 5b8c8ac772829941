// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use sapling_arena::{Arena, ArenaBacking, MemoryLedger, DEFAULT_PAGE_SIZE};
use sapling_shared::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::subsystem::{Subsystem, SubsystemId};
use crate::txn::{Frame, Txn, TxnMode};

/// Environment construction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub page_size: u32,
    pub backing: ArenaBacking,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            page_size: DEFAULT_PAGE_SIZE as u32,
            backing: ArenaBacking::default(),
        }
    }
}

/// Owner of one arena and the table of registered subsystems.
///
/// The environment is single-writer by construction: it is not `Sync`,
/// and all interior access goes through `try_borrow` so re-entrant use
/// surfaces as `Busy` instead of a panic. Registration happens once,
/// before the first transaction; after that the slot table is immutable.
pub struct Env {
    arena: RefCell<Arena>,
    ledger: Arc<MemoryLedger>,
    page_size: usize,
    slots: Vec<Option<Box<dyn Subsystem>>>,
    order: Vec<SubsystemId>,
    env_states: Vec<RefCell<Option<Box<dyn Any>>>>,
    pub(crate) stack: RefCell<Vec<Frame>>,
    txn_ever: Cell<bool>,
}

impl Env {
    /// Take ownership of an arena. The arena lives exactly as long as the
    /// environment.
    pub fn new(arena: Arena) -> Env {
        let ledger = arena.ledger().clone();
        let page_size = arena.page_size();
        Env {
            arena: RefCell::new(arena),
            ledger,
            page_size,
            slots: (0..SubsystemId::COUNT).map(|_| None).collect(),
            order: Vec::new(),
            env_states: (0..SubsystemId::COUNT).map(|_| RefCell::new(None)).collect(),
            stack: RefCell::new(Vec::new()),
            txn_ever: Cell::new(false),
        }
    }

    pub fn with_config(config: &EnvConfig) -> Result<Env> {
        let arena = Arena::new(config.backing.clone(), config.page_size as usize)?;
        Ok(Env::new(arena))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// Install a subsystem. Rejected once any transaction has begun, so
    /// every txn ever started sees the same slot table.
    pub fn register_subsystem(&mut self, id: SubsystemId, sub: Box<dyn Subsystem>) -> Result<()> {
        if self.txn_ever.get() {
            return Err(Error::invalid(
                "subsystem registration after the first transaction",
            ));
        }
        if self.slots[id.index()].is_some() {
            return Err(Error::Exists);
        }
        self.slots[id.index()] = Some(sub);
        self.order.push(id);
        log::debug!("registered subsystem {}", id.name());
        Ok(())
    }

    pub fn has_subsystem(&self, id: SubsystemId) -> bool {
        self.slots[id.index()].is_some()
    }

    /// Replace the subsystem's environment-level state.
    pub fn set_subsystem_state(&self, id: SubsystemId, state: Box<dyn Any>) -> Result<()> {
        let mut cell = self.env_states[id.index()]
            .try_borrow_mut()
            .map_err(|_| Error::Busy("environment state"))?;
        *cell = Some(state);
        Ok(())
    }

    pub fn with_subsystem_state<S: Any, R>(
        &self,
        id: SubsystemId,
        f: impl FnOnce(&S) -> Result<R>,
    ) -> Result<R> {
        let cell = self.env_states[id.index()]
            .try_borrow()
            .map_err(|_| Error::Busy("environment state"))?;
        let state = cell
            .as_deref()
            .ok_or_else(|| Error::invalid(format!("subsystem {} has no env state", id.name())))?;
        let state = state
            .downcast_ref::<S>()
            .ok_or(Error::Corrupt("subsystem env state type"))?;
        f(state)
    }

    pub fn with_subsystem_state_mut<S: Any, R>(
        &self,
        id: SubsystemId,
        f: impl FnOnce(&mut S) -> Result<R>,
    ) -> Result<R> {
        let mut cell = self.env_states[id.index()]
            .try_borrow_mut()
            .map_err(|_| Error::Busy("environment state"))?;
        let state = cell
            .as_deref_mut()
            .ok_or_else(|| Error::invalid(format!("subsystem {} has no env state", id.name())))?;
        let state = state
            .downcast_mut::<S>()
            .ok_or(Error::Corrupt("subsystem env state type"))?;
        f(state)
    }

    pub fn with_arena<R>(&self, f: impl FnOnce(&Arena) -> Result<R>) -> Result<R> {
        let arena = self.arena.try_borrow().map_err(|_| Error::Busy("arena"))?;
        f(&arena)
    }

    pub fn with_arena_mut<R>(&self, f: impl FnOnce(&mut Arena) -> Result<R>) -> Result<R> {
        let mut arena = self.arena.try_borrow_mut().map_err(|_| Error::Busy("arena"))?;
        f(&mut arena)
    }

    /// Begin a root transaction. Nested transactions come from
    /// [`Txn::begin_nested`], which is what keeps the frame stack honest.
    pub fn begin(&self, mode: TxnMode) -> Result<Txn<'_>> {
        {
            let stack = self
                .stack
                .try_borrow()
                .map_err(|_| Error::Busy("transaction stack"))?;
            if !stack.is_empty() {
                return Err(Error::invalid(
                    "root transaction begun while another transaction is active",
                ));
            }
        }
        let level = self.begin_frame(mode)?;
        log::trace!("begin root txn ({mode:?})");
        Ok(Txn::new(self, level, mode))
    }

    /// Push a new frame, running each subsystem's `on_begin` in
    /// registration order. Partial failure aborts the states already built,
    /// in reverse, and leaves the stack untouched.
    pub(crate) fn begin_frame(&self, mode: TxnMode) -> Result<usize> {
        self.txn_ever.set(true);
        let mut built: Vec<Option<Box<dyn Any>>> =
            (0..SubsystemId::COUNT).map(|_| None).collect();
        {
            let stack = self
                .stack
                .try_borrow()
                .map_err(|_| Error::Busy("transaction stack"))?;
            let parent = stack.last();
            for (started, &id) in self.order.iter().enumerate() {
                let sub = self.slot(id);
                let parent_state = parent.and_then(|f| f.state(id));
                match sub.on_begin(self, parent_state) {
                    Ok(state) => built[id.index()] = Some(state),
                    Err(e) => {
                        log::debug!("subsystem {} begin failed: {e:#}", id.name());
                        for &done in self.order[..started].iter().rev() {
                            if let Some(state) = built[done.index()].take() {
                                self.slot(done).on_abort(self, state);
                            }
                        }
                        return Err(Error::invalid(format!(
                            "subsystem {} begin: {e:#}",
                            id.name()
                        )));
                    }
                }
            }
        }
        let mut stack = self
            .stack
            .try_borrow_mut()
            .map_err(|_| Error::Busy("transaction stack"))?;
        stack.push(Frame::new(built));
        log::trace!("pushed txn frame at depth {} ({mode:?})", stack.len() - 1);
        Ok(stack.len() - 1)
    }

    /// Commit the frame at `level` (which must be the top of the stack).
    /// `on_commit` runs in registration order; the first failure aborts the
    /// not-yet-committed remainder and propagates.
    pub(crate) fn commit_frame(&self, level: usize) -> Result<()> {
        let mut frame = self.pop_frame(level)?;
        let is_root = level == 0;
        for (committed, &id) in self.order.iter().enumerate() {
            let Some(state) = frame.take_state(id) else {
                continue;
            };
            let sub = self.slot(id);
            let res = if is_root {
                sub.on_commit(self, state, None)
            } else {
                let mut stack = self
                    .stack
                    .try_borrow_mut()
                    .map_err(|_| Error::Busy("transaction stack"))?;
                let parent = stack
                    .last_mut()
                    .expect("nested commit has a parent frame");
                sub.on_commit(self, state, parent.state_mut(id))
            };
            if let Err(e) = res {
                log::debug!("subsystem {} commit failed: {e:#}", id.name());
                for &rest in &self.order[committed + 1..] {
                    if let Some(state) = frame.take_state(rest) {
                        self.slot(rest).on_abort(self, state);
                    }
                }
                self.release_scratch(frame);
                return Err(Error::invalid(format!(
                    "subsystem {} commit: {e:#}",
                    id.name()
                )));
            }
        }
        self.release_scratch(frame);
        log::trace!("committed txn at depth {level}");
        Ok(())
    }

    /// Abort the frame at `level`, running `on_abort` in reverse
    /// registration order. Must not fail: called from guard drops.
    pub(crate) fn abort_frame(&self, level: usize) {
        let mut frame = match self.pop_frame(level) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("abandoning transaction frame at depth {level}: {e}");
                return;
            }
        };
        for &id in self.order.iter().rev() {
            if let Some(state) = frame.take_state(id) {
                self.slot(id).on_abort(self, state);
            }
        }
        self.release_scratch(frame);
        log::trace!("aborted txn at depth {level}");
    }

    fn pop_frame(&self, level: usize) -> Result<Frame> {
        let mut stack = self
            .stack
            .try_borrow_mut()
            .map_err(|_| Error::Busy("transaction stack"))?;
        if stack.len() != level + 1 {
            return Err(Error::Corrupt("transaction stack out of order"));
        }
        Ok(stack.pop().expect("stack length checked above"))
    }

    fn release_scratch(&self, frame: Frame) {
        for buf in frame.into_scratch() {
            self.ledger.refund(buf.len());
        }
    }

    fn slot(&self, id: SubsystemId) -> &dyn Subsystem {
        self.slots[id.index()]
            .as_deref()
            .expect("subsystem in registration order is present")
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        // Any live txn guard borrows the env, so in safe code the stack is
        // already empty here.
        for i in (0..self.order.len()).rev() {
            let id = self.order[i];
            let state = self.env_states[id.index()].borrow_mut().take();
            if let Some(sub) = self.slots[id.index()].as_deref() {
                sub.on_env_destroy(self, state);
            }
        }
        log::trace!("environment destroyed");
    }
}
