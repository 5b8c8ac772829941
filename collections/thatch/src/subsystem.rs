// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::any::Any;

use sapling::{Env, Subsystem, SubsystemId};
use sapling_shared::Result;

use crate::region::Region;

/// Environment state: regions published by committed root txns, plus the
/// id counter. Ids are monotonic for the life of the environment.
pub(crate) struct ThatchEnvState {
    pub(crate) regions: Vec<Region>,
    pub(crate) next_id: u32,
}

/// Per-txn state: the active-regions list.
pub(crate) struct ThatchTxnState {
    pub(crate) regions: Vec<Region>,
}

pub struct ThatchSubsystem;

impl Subsystem for ThatchSubsystem {
    fn on_begin(&self, _env: &Env, _parent: Option<&dyn Any>) -> anyhow::Result<Box<dyn Any>> {
        Ok(Box::new(ThatchTxnState {
            regions: Vec::new(),
        }))
    }

    fn on_commit(
        &self,
        env: &Env,
        state: Box<dyn Any>,
        parent: Option<&mut dyn Any>,
    ) -> anyhow::Result<()> {
        let mut state = state
            .downcast::<ThatchTxnState>()
            .map_err(|_| anyhow::anyhow!("thatch txn state has a foreign type"))?;
        for region in &mut state.regions {
            region.sealed = true;
        }
        match parent {
            Some(parent) => {
                // Splice onto the parent's active list so a later parent
                // abort still frees these pages.
                let parent = parent
                    .downcast_mut::<ThatchTxnState>()
                    .ok_or_else(|| anyhow::anyhow!("thatch parent state has a foreign type"))?;
                parent.regions.append(&mut state.regions);
            }
            None => {
                env.with_subsystem_state_mut(SubsystemId::Thatch, |s: &mut ThatchEnvState| {
                    s.regions.append(&mut state.regions);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    fn on_abort(&self, env: &Env, state: Box<dyn Any>) {
        let Ok(state) = state.downcast::<ThatchTxnState>() else {
            log::error!("thatch abort saw a foreign state type");
            return;
        };
        let res = env.with_arena_mut(|arena| {
            for region in &state.regions {
                arena.free_page(region.page)?;
            }
            Ok(())
        });
        if let Err(e) = res {
            log::error!("thatch abort failed to free region pages: {e}");
        }
    }
}

/// Register the Thatch subsystem and its empty committed state.
pub fn init(env: &mut Env) -> Result<()> {
    env.register_subsystem(SubsystemId::Thatch, Box::new(ThatchSubsystem))?;
    env.set_subsystem_state(
        SubsystemId::Thatch,
        Box::new(ThatchEnvState {
            regions: Vec::new(),
            next_id: 0,
        }),
    )
}
