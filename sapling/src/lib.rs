// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sapling engine core.
//!
//! An [`Env`] owns one arena and a fixed table of registered subsystems;
//! a [`Txn`] is the unit of mutation. Every subsystem plugs its lifecycle
//! into the transaction through the [`Subsystem`] callbacks: begin builds
//! per-txn state from the parent's, commit promotes child state into the
//! parent (or publishes into the environment for a root commit), abort
//! undoes. Collections never touch the arena except through a txn, which
//! is what makes "success promotes, failure undoes" enforceable in one
//! place.

mod env;
mod subsystem;
mod txn;

pub use self::env::{Env, EnvConfig};
pub use self::subsystem::{Subsystem, SubsystemId};
pub use self::txn::{ScratchId, Txn, TxnMode};

pub use sapling_shared::{Error, ErrorCode, Result};
