// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::any::Any;

use crate::Env;

/// Identity of a registered subsystem. The set is closed: slots are a fixed
/// table, not an open registry, so ids double as table indices.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum SubsystemId {
    Seq = 0,
    Bept = 1,
    Thatch = 2,
}

impl SubsystemId {
    pub const COUNT: usize = 3;

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SubsystemId::Seq => "seq",
            SubsystemId::Bept => "bept",
            SubsystemId::Thatch => "thatch",
        }
    }
}

/// Lifecycle callbacks a subsystem registers with an environment.
///
/// Per-txn state is opaque to the engine (`Box<dyn Any>`); each subsystem
/// downcasts its own. Callback errors cross this boundary as
/// `anyhow::Error` and are folded into the flat taxonomy by the engine.
///
/// Contract notes:
/// - `on_begin` with `parent == None` starts a root txn; the subsystem
///   should derive its state from whatever it published into the env.
///   Callbacks must not begin, commit, or abort transactions themselves.
/// - `on_commit` with `parent == None` is a root commit: publish into env
///   state. With `Some`, merge into the parent txn's state. Commits run in
///   registration order; a failure aborts the not-yet-committed remainder,
///   so a subsystem whose publish step can fail accepts partial-commit
///   risk for the subsystems registered before it.
/// - `on_abort` must fully undo the state's draft allocations and cannot
///   fail. Aborts run in reverse registration order.
pub trait Subsystem: 'static {
    fn on_begin(&self, env: &Env, parent: Option<&dyn Any>) -> anyhow::Result<Box<dyn Any>>;

    fn on_commit(
        &self,
        env: &Env,
        state: Box<dyn Any>,
        parent: Option<&mut dyn Any>,
    ) -> anyhow::Result<()>;

    fn on_abort(&self, env: &Env, state: Box<dyn Any>);

    /// Invoked while the environment is torn down, with whatever env state
    /// the subsystem had published. The default just drops it.
    fn on_env_destroy(&self, env: &Env, state: Option<Box<dyn Any>>) {
        let _ = (env, state);
    }
}
