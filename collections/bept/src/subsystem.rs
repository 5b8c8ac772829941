// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::any::Any;

use sapling::{Env, Subsystem, SubsystemId};
use sapling_arena::NodeNo;
use sapling_shared::Result;

/// Environment-level state: the committed root.
pub(crate) struct BeptEnvState {
    pub(crate) root: Option<NodeNo>,
}

/// Per-txn state: a draft root plus the arena node ids this txn's rebuilds
/// allocated and displaced. Commit promotes the root and frees the
/// displaced; abort frees the allocated.
pub(crate) struct BeptTxnState {
    pub(crate) root: Option<NodeNo>,
    pub(crate) allocated: Vec<NodeNo>,
    pub(crate) displaced: Vec<NodeNo>,
}

pub struct BeptSubsystem;

impl BeptSubsystem {
    /// Return a batch of trie nodes to the arena. Values are inline in
    /// their leaves, so freeing the node frees everything it owns.
    fn reclaim(env: &Env, ids: &[NodeNo]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        env.with_arena_mut(|arena| {
            for &id in ids {
                arena.free_node(id)?;
            }
            Ok(())
        })
    }
}

impl Subsystem for BeptSubsystem {
    fn on_begin(&self, env: &Env, parent: Option<&dyn Any>) -> anyhow::Result<Box<dyn Any>> {
        let root = match parent {
            Some(parent) => {
                parent
                    .downcast_ref::<BeptTxnState>()
                    .ok_or_else(|| anyhow::anyhow!("bept parent state has a foreign type"))?
                    .root
            }
            None => env.with_subsystem_state(SubsystemId::Bept, |s: &BeptEnvState| Ok(s.root))?,
        };
        Ok(Box::new(BeptTxnState {
            root,
            allocated: Vec::new(),
            displaced: Vec::new(),
        }))
    }

    fn on_commit(
        &self,
        env: &Env,
        state: Box<dyn Any>,
        parent: Option<&mut dyn Any>,
    ) -> anyhow::Result<()> {
        let state = state
            .downcast::<BeptTxnState>()
            .map_err(|_| anyhow::anyhow!("bept txn state has a foreign type"))?;
        match parent {
            Some(parent) => {
                let parent = parent
                    .downcast_mut::<BeptTxnState>()
                    .ok_or_else(|| anyhow::anyhow!("bept parent state has a foreign type"))?;
                parent.root = state.root;
                parent.allocated.extend(state.allocated);
                parent.displaced.extend(state.displaced);
            }
            None => {
                env.with_subsystem_state_mut(SubsystemId::Bept, |s: &mut BeptEnvState| {
                    s.root = state.root;
                    Ok(())
                })?;
                // The displaced path copies are unreachable from the new
                // committed root; reclaim them now.
                Self::reclaim(env, &state.displaced)?;
            }
        }
        Ok(())
    }

    fn on_abort(&self, env: &Env, state: Box<dyn Any>) {
        let Ok(state) = state.downcast::<BeptTxnState>() else {
            log::error!("bept abort saw a foreign state type");
            return;
        };
        if let Err(e) = Self::reclaim(env, &state.allocated) {
            log::error!("bept abort failed to reclaim draft nodes: {e}");
        }
    }
}

/// Register the BEPT subsystem and its empty committed state.
pub fn init(env: &mut Env) -> Result<()> {
    env.register_subsystem(SubsystemId::Bept, Box::new(BeptSubsystem))?;
    env.set_subsystem_state(SubsystemId::Bept, Box::new(BeptEnvState { root: None }))
}
