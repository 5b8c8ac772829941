// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::any::Any;

use sapling_arena::Arena;
use sapling_shared::{Error, Result};

use crate::subsystem::SubsystemId;
use crate::Env;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxnMode {
    ReadWrite,
    ReadOnly,
}

/// Handle to a transaction-scoped buffer from [`Txn::scratch_alloc`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ScratchId(pub(crate) u32);

/// One level of the transaction stack: per-subsystem states plus scratch
/// allocations, both released when the frame ends.
pub(crate) struct Frame {
    states: Vec<Option<Box<dyn Any>>>,
    scratch: Vec<Box<[u8]>>,
}

impl Frame {
    pub(crate) fn new(states: Vec<Option<Box<dyn Any>>>) -> Frame {
        Frame {
            states,
            scratch: Vec::new(),
        }
    }

    pub(crate) fn state(&self, id: SubsystemId) -> Option<&dyn Any> {
        self.states[id.index()].as_deref()
    }

    pub(crate) fn state_mut(&mut self, id: SubsystemId) -> Option<&mut dyn Any> {
        self.states[id.index()].as_deref_mut()
    }

    pub(crate) fn take_state(&mut self, id: SubsystemId) -> Option<Box<dyn Any>> {
        self.states[id.index()].take()
    }

    pub(crate) fn scratch(&self) -> &[Box<[u8]>] {
        &self.scratch
    }

    pub(crate) fn scratch_mut(&mut self) -> &mut Vec<Box<[u8]>> {
        &mut self.scratch
    }

    pub(crate) fn into_scratch(self) -> Vec<Box<[u8]>> {
        self.scratch
    }
}

/// The unit of mutation. A `Txn` is a guard over one frame of the env's
/// transaction stack: committing promotes the frame into its parent (or the
/// env, for a root txn), aborting discards it, and dropping an unfinished
/// guard aborts. Beginning a nested txn mutably borrows the parent, so the
/// parent cannot be used — or committed — while the child is alive.
pub struct Txn<'e> {
    env: &'e Env,
    level: usize,
    mode: TxnMode,
    finished: bool,
}

impl<'e> std::fmt::Debug for Txn<'e> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("level", &self.level)
            .field("mode", &self.mode)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'e> Txn<'e> {
    pub(crate) fn new(env: &'e Env, level: usize, mode: TxnMode) -> Txn<'e> {
        Txn {
            env,
            level,
            mode,
            finished: false,
        }
    }

    pub fn env(&self) -> &'e Env {
        self.env
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    pub fn depth(&self) -> usize {
        self.level
    }

    pub fn is_root(&self) -> bool {
        self.level == 0
    }

    /// Every mutating subsystem entry point calls this first.
    pub fn require_writable(&self) -> Result<()> {
        match self.mode {
            TxnMode::ReadWrite => Ok(()),
            TxnMode::ReadOnly => Err(Error::ReadOnly),
        }
    }

    /// Begin a child transaction. A read-write child under a read-only
    /// parent is rejected; a read-only child under a read-write parent is
    /// fine.
    pub fn begin_nested(&mut self, mode: TxnMode) -> Result<Txn<'_>> {
        if self.mode == TxnMode::ReadOnly && mode == TxnMode::ReadWrite {
            return Err(Error::invalid(
                "read-write transaction nested in a read-only parent",
            ));
        }
        let level = self.env.begin_frame(mode)?;
        debug_assert_eq!(level, self.level + 1);
        log::trace!("begin nested txn at depth {level} ({mode:?})");
        Ok(Txn::new(self.env, level, mode))
    }

    /// Commit this transaction, promoting its state into the parent (or
    /// publishing it into the env for a root txn). On error the states not
    /// yet committed have been aborted and the guard is spent; built-in
    /// subsystems publish infallibly, so their commits are all-or-nothing.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.env.commit_frame(self.level)
    }

    /// Abort, undoing every subsystem's draft state. Dropping an
    /// unfinished txn does the same; this form just makes it explicit.
    pub fn abort(mut self) {
        self.finished = true;
        self.env.abort_frame(self.level);
    }

    /// Access this txn's state for a subsystem.
    pub fn with_state<S: Any, R>(
        &self,
        id: SubsystemId,
        f: impl FnOnce(&S) -> Result<R>,
    ) -> Result<R> {
        let stack = self
            .env
            .stack
            .try_borrow()
            .map_err(|_| Error::Busy("transaction stack"))?;
        let frame = stack
            .get(self.level)
            .ok_or(Error::Corrupt("transaction frame missing"))?;
        let state = frame
            .state(id)
            .ok_or_else(|| Error::invalid(format!("subsystem {} not registered", id.name())))?;
        let state = state
            .downcast_ref::<S>()
            .ok_or(Error::Corrupt("subsystem txn state type"))?;
        f(state)
    }

    pub fn with_state_mut<S: Any, R>(
        &mut self,
        id: SubsystemId,
        f: impl FnOnce(&mut S) -> Result<R>,
    ) -> Result<R> {
        let mut stack = self
            .env
            .stack
            .try_borrow_mut()
            .map_err(|_| Error::Busy("transaction stack"))?;
        let frame = stack
            .get_mut(self.level)
            .ok_or(Error::Corrupt("transaction frame missing"))?;
        let state = frame
            .state_mut(id)
            .ok_or_else(|| Error::invalid(format!("subsystem {} not registered", id.name())))?;
        let state = state
            .downcast_mut::<S>()
            .ok_or(Error::Corrupt("subsystem txn state type"))?;
        f(state)
    }

    /// Access the subsystem's state in every frame of this txn's ancestry,
    /// innermost first. Used by subsystems whose per-txn resources stay
    /// writable from descendants (e.g. packed regions).
    pub fn with_state_chain_mut<S: Any, R>(
        &mut self,
        id: SubsystemId,
        f: impl FnOnce(&mut [&mut S]) -> Result<R>,
    ) -> Result<R> {
        let mut stack = self
            .env
            .stack
            .try_borrow_mut()
            .map_err(|_| Error::Busy("transaction stack"))?;
        let frames = stack
            .get_mut(..=self.level)
            .ok_or(Error::Corrupt("transaction frame missing"))?;
        let mut chain: Vec<&mut S> = Vec::with_capacity(frames.len());
        for frame in frames.iter_mut().rev() {
            let state = frame
                .state_mut(id)
                .ok_or_else(|| Error::invalid(format!("subsystem {} not registered", id.name())))?;
            chain.push(
                state
                    .downcast_mut::<S>()
                    .ok_or(Error::Corrupt("subsystem txn state type"))?,
            );
        }
        f(&mut chain)
    }

    /// Read-only variant of [`Txn::with_state_chain_mut`].
    pub fn with_state_chain<S: Any, R>(
        &self,
        id: SubsystemId,
        f: impl FnOnce(&[&S]) -> Result<R>,
    ) -> Result<R> {
        let stack = self
            .env
            .stack
            .try_borrow()
            .map_err(|_| Error::Busy("transaction stack"))?;
        let frames = stack
            .get(..=self.level)
            .ok_or(Error::Corrupt("transaction frame missing"))?;
        let mut chain: Vec<&S> = Vec::with_capacity(frames.len());
        for frame in frames.iter().rev() {
            let state = frame
                .state(id)
                .ok_or_else(|| Error::invalid(format!("subsystem {} not registered", id.name())))?;
            chain.push(
                state
                    .downcast_ref::<S>()
                    .ok_or(Error::Corrupt("subsystem txn state type"))?,
            );
        }
        f(&chain)
    }

    pub fn with_arena<R>(&self, f: impl FnOnce(&Arena) -> Result<R>) -> Result<R> {
        self.env.with_arena(f)
    }

    pub fn with_arena_mut<R>(&mut self, f: impl FnOnce(&mut Arena) -> Result<R>) -> Result<R> {
        self.env.with_arena_mut(f)
    }

    /// Allocate a zeroed buffer that lives until this txn ends.
    pub fn scratch_alloc(&mut self, len: usize) -> Result<ScratchId> {
        let ledger = self.env.ledger().clone();
        ledger
            .charge(len)
            .map_err(|_| Error::Oom("transaction scratch"))?;
        let undo = |e| {
            ledger.refund(len);
            e
        };
        let mut stack = self
            .env
            .stack
            .try_borrow_mut()
            .map_err(|_| undo(Error::Busy("transaction stack")))?;
        let frame = match stack.get_mut(self.level) {
            Some(frame) => frame,
            None => return Err(undo(Error::Corrupt("transaction frame missing"))),
        };
        let scratch = frame.scratch_mut();
        if scratch.len() > u32::MAX as usize {
            return Err(undo(Error::Full("scratch ids")));
        }
        scratch.push(vec![0u8; len].into_boxed_slice());
        Ok(ScratchId((scratch.len() - 1) as u32))
    }

    pub fn with_scratch<R>(
        &self,
        id: ScratchId,
        f: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R> {
        let stack = self
            .env
            .stack
            .try_borrow()
            .map_err(|_| Error::Busy("transaction stack"))?;
        let frame = stack
            .get(self.level)
            .ok_or(Error::Corrupt("transaction frame missing"))?;
        let buf = frame
            .scratch()
            .get(id.0 as usize)
            .ok_or_else(|| Error::invalid("unknown scratch id"))?;
        f(buf)
    }

    pub fn with_scratch_mut<R>(
        &mut self,
        id: ScratchId,
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        let mut stack = self
            .env
            .stack
            .try_borrow_mut()
            .map_err(|_| Error::Busy("transaction stack"))?;
        let frame = stack
            .get_mut(self.level)
            .ok_or(Error::Corrupt("transaction frame missing"))?;
        let buf = frame
            .scratch_mut()
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::invalid("unknown scratch id"))?;
        f(buf)
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.env.abort_frame(self.level);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;
    use sapling_arena::{Arena, ArenaBacking};
    use sapling_shared::ErrorCode;

    use super::*;
    use crate::{Env, Subsystem};

    /// Counter-bearing state used to observe begin/commit/abort plumbing.
    struct CounterState {
        value: u64,
    }

    /// Test subsystem: txn state snapshots the parent's counter; commit
    /// writes it back; every callback is journaled.
    struct Recorder {
        id: SubsystemId,
        journal: Rc<RefCell<Vec<String>>>,
        fail_begin: bool,
    }

    impl Recorder {
        fn new(id: SubsystemId, journal: Rc<RefCell<Vec<String>>>) -> Box<Recorder> {
            Box::new(Recorder {
                id,
                journal,
                fail_begin: false,
            })
        }

        fn log(&self, what: &str) {
            self.journal
                .borrow_mut()
                .push(format!("{}:{}", self.id.name(), what));
        }
    }

    impl Subsystem for Recorder {
        fn on_begin(&self, env: &Env, parent: Option<&dyn Any>) -> anyhow::Result<Box<dyn Any>> {
            self.log("begin");
            if self.fail_begin {
                anyhow::bail!("induced begin failure");
            }
            let value = match parent {
                Some(parent) => parent.downcast_ref::<CounterState>().unwrap().value,
                None => env.with_subsystem_state(self.id, |s: &CounterState| Ok(s.value))?,
            };
            Ok(Box::new(CounterState { value }))
        }

        fn on_commit(
            &self,
            env: &Env,
            state: Box<dyn Any>,
            parent: Option<&mut dyn Any>,
        ) -> anyhow::Result<()> {
            self.log("commit");
            let state = state.downcast::<CounterState>().unwrap();
            match parent {
                Some(parent) => {
                    parent.downcast_mut::<CounterState>().unwrap().value = state.value;
                }
                None => env.with_subsystem_state_mut(self.id, |s: &mut CounterState| {
                    s.value = state.value;
                    Ok(())
                })?,
            }
            Ok(())
        }

        fn on_abort(&self, _env: &Env, _state: Box<dyn Any>) {
            self.log("abort");
        }
    }

    fn test_env(journal: &Rc<RefCell<Vec<String>>>) -> Env {
        let arena = Arena::new(ArenaBacking::Malloc { max_bytes: None }, 4096).unwrap();
        let mut env = Env::new(arena);
        for id in [SubsystemId::Seq, SubsystemId::Bept] {
            env.register_subsystem(id, Recorder::new(id, journal.clone()))
                .unwrap();
            env.set_subsystem_state(id, Box::new(CounterState { value: 0 }))
                .unwrap();
        }
        env
    }

    fn bump(txn: &mut Txn<'_>, id: SubsystemId, by: u64) {
        txn.require_writable().unwrap();
        txn.with_state_mut(id, |s: &mut CounterState| {
            s.value += by;
            Ok(())
        })
        .unwrap();
    }

    fn committed(env: &Env, id: SubsystemId) -> u64 {
        env.with_subsystem_state(id, |s: &CounterState| Ok(s.value))
            .unwrap()
    }

    #[test]
    fn commit_publishes_abort_discards() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let env = test_env(&journal);

        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        bump(&mut txn, SubsystemId::Seq, 5);
        txn.commit().unwrap();
        assert_eq!(committed(&env, SubsystemId::Seq), 5);

        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        bump(&mut txn, SubsystemId::Seq, 100);
        txn.abort();
        assert_eq!(committed(&env, SubsystemId::Seq), 5);
    }

    #[test]
    fn dropping_an_unfinished_txn_aborts() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let env = test_env(&journal);
        {
            let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
            bump(&mut txn, SubsystemId::Seq, 9);
        }
        assert_eq!(committed(&env, SubsystemId::Seq), 0);
        assert!(journal.borrow().contains(&"seq:abort".to_string()));
    }

    #[test]
    fn nested_commit_merges_into_parent_only() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let env = test_env(&journal);

        let mut root = env.begin(TxnMode::ReadWrite).unwrap();
        bump(&mut root, SubsystemId::Seq, 1);
        {
            let mut child = root.begin_nested(TxnMode::ReadWrite).unwrap();
            // Child begins from the parent's state, not the env's.
            child
                .with_state(SubsystemId::Seq, |s: &CounterState| {
                    assert_eq!(s.value, 1);
                    Ok(())
                })
                .unwrap();
            bump(&mut child, SubsystemId::Seq, 10);
            child.commit().unwrap();
        }
        // Merged into the parent, not published.
        assert_eq!(committed(&env, SubsystemId::Seq), 0);
        root.commit().unwrap();
        assert_eq!(committed(&env, SubsystemId::Seq), 11);
    }

    #[test]
    fn nested_abort_keeps_parent_state() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let env = test_env(&journal);

        let mut root = env.begin(TxnMode::ReadWrite).unwrap();
        bump(&mut root, SubsystemId::Seq, 7);
        {
            let mut child = root.begin_nested(TxnMode::ReadWrite).unwrap();
            bump(&mut child, SubsystemId::Seq, 1000);
            child.abort();
        }
        root.with_state(SubsystemId::Seq, |s: &CounterState| {
            assert_eq!(s.value, 7);
            Ok(())
        })
        .unwrap();
        root.commit().unwrap();
        assert_eq!(committed(&env, SubsystemId::Seq), 7);
    }

    #[test]
    fn read_only_rules() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let env = test_env(&journal);

        let mut ro = env.begin(TxnMode::ReadOnly).unwrap();
        assert_eq!(ro.require_writable().unwrap_err().code(), ErrorCode::ReadOnly);
        assert_eq!(
            ro.begin_nested(TxnMode::ReadWrite).unwrap_err().code(),
            ErrorCode::Invalid
        );
        let child = ro.begin_nested(TxnMode::ReadOnly).unwrap();
        child.commit().unwrap();
        ro.commit().unwrap();
    }

    #[test]
    fn begin_failure_rolls_back_started_subsystems() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let arena = Arena::new(ArenaBacking::Malloc { max_bytes: None }, 4096).unwrap();
        let mut env = Env::new(arena);
        env.register_subsystem(
            SubsystemId::Seq,
            Recorder::new(SubsystemId::Seq, journal.clone()),
        )
        .unwrap();
        env.set_subsystem_state(SubsystemId::Seq, Box::new(CounterState { value: 0 }))
            .unwrap();
        let mut failing = Recorder::new(SubsystemId::Bept, journal.clone());
        failing.fail_begin = true;
        env.register_subsystem(SubsystemId::Bept, failing).unwrap();
        env.set_subsystem_state(SubsystemId::Bept, Box::new(CounterState { value: 0 }))
            .unwrap();

        assert_eq!(
            env.begin(TxnMode::ReadWrite).unwrap_err().code(),
            ErrorCode::Invalid
        );
        assert_eq!(
            *journal.borrow(),
            vec!["seq:begin", "bept:begin", "seq:abort"]
        );
        // The failed begin left no frame behind.
        env.begin(TxnMode::ReadWrite).unwrap().commit().unwrap();
    }

    #[test]
    fn registration_after_first_txn_is_rejected() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let mut env = test_env(&journal);
        env.begin(TxnMode::ReadOnly).unwrap().commit().unwrap();
        let err = env
            .register_subsystem(
                SubsystemId::Thatch,
                Recorder::new(SubsystemId::Thatch, journal.clone()),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid);
    }

    #[test]
    fn second_root_txn_is_rejected_while_one_is_active() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let env = test_env(&journal);
        let txn = env.begin(TxnMode::ReadWrite).unwrap();
        assert_eq!(
            env.begin(TxnMode::ReadWrite).unwrap_err().code(),
            ErrorCode::Invalid
        );
        txn.commit().unwrap();
    }

    #[test]
    fn scratch_is_txn_scoped() {
        let journal = Rc::new(RefCell::new(Vec::new()));
        let env = test_env(&journal);
        let ledger_before = env.ledger().bytes_in_use();

        let mut txn = env.begin(TxnMode::ReadWrite).unwrap();
        let id = txn.scratch_alloc(128).unwrap();
        txn.with_scratch_mut(id, |buf| {
            assert!(buf.iter().all(|&b| b == 0));
            buf[0] = 0xFF;
            Ok(())
        })
        .unwrap();
        txn.with_scratch(id, |buf| {
            assert_eq!(buf[0], 0xFF);
            Ok(())
        })
        .unwrap();
        assert!(env.ledger().bytes_in_use() > ledger_before);
        txn.commit().unwrap();
        assert_eq!(env.ledger().bytes_in_use(), ledger_before);
    }
}
