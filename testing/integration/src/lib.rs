// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Harness helpers for driving the whole Sapling engine in tests.

use sapling::{Env, EnvConfig, Result};
use sapling_arena::ArenaBacking;

/// An environment with every built-in subsystem registered, using the
/// default page size and an uncapped heap backing.
pub fn full_env() -> Result<Env> {
    full_env_with(EnvConfig::default())
}

/// Same, with a byte budget — handy for exercising `Oom` paths.
pub fn capped_env(max_bytes: usize, page_size: u32) -> Result<Env> {
    full_env_with(EnvConfig {
        page_size,
        backing: ArenaBacking::Linear {
            initial: 0,
            max: max_bytes,
        },
    })
}

pub fn full_env_with(config: EnvConfig) -> Result<Env> {
    let mut env = Env::with_config(&config)?;
    sapling_seq::init(&mut env)?;
    sapling_bept::init(&mut env)?;
    sapling_thatch::init(&mut env)?;
    Ok(env)
}
