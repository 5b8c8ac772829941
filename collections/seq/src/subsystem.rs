// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::any::Any;

use sapling::{Env, Subsystem, SubsystemId};
use sapling_shared::Result;

/// Per-txn marker state. Sequences are copy-on-write at the Text layer, so
/// there is nothing to merge on commit or undo on abort; the state's only
/// job is to make "registered before use" checkable per transaction.
pub(crate) struct SeqTxnState;

pub struct SeqSubsystem;

impl Subsystem for SeqSubsystem {
    fn on_begin(&self, _env: &Env, _parent: Option<&dyn Any>) -> anyhow::Result<Box<dyn Any>> {
        Ok(Box::new(SeqTxnState))
    }

    fn on_commit(
        &self,
        _env: &Env,
        _state: Box<dyn Any>,
        _parent: Option<&mut dyn Any>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_abort(&self, _env: &Env, _state: Box<dyn Any>) {}
}

/// Register the Seq subsystem with an environment.
pub fn init(env: &mut Env) -> Result<()> {
    env.register_subsystem(SubsystemId::Seq, Box::new(SeqSubsystem))
}
