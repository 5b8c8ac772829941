// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Persistent-friendly sequence of 32-bit element handles.
//!
//! [`Seq`] is a 2-3 finger tree whose spine levels, digits and 2-3 nodes
//! are all arena nodes addressed by integer ids — no structural link is a
//! host pointer, which keeps sequences expressible in one linear memory.
//! Amortised O(1) push/pop at both ends, O(log n) concat, split and index;
//! element counts are cached at every branch. An arena allocation refused
//! mid-mutation surfaces as `Oom` and *poisons* the sequence — every later
//! mutator answers `Invalid` until [`Seq::reset`] succeeds.

mod seq;
mod subsystem;
mod tree;

pub use self::seq::Seq;
pub use self::subsystem::{init, SeqSubsystem};
