// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Thatch: bump-allocated packed byte regions slaved to the transaction.
//!
//! A region is one arena page with a write cursor. Writers append tags and
//! data, may reserve a four-byte *skip* slot and backpatch it later with
//! the number of bytes written since — the length prefix that lets readers
//! bypass a subtree in O(1). Committing a transaction seals its regions:
//! a nested commit splices them onto the parent (so a later parent abort
//! still frees them), a root commit publishes them for readers of the
//! environment. Abort frees the page.
//!
//! Skip and length words are stored in native byte order; regions are not
//! portable across hosts.

mod reader;
mod region;
mod subsystem;
mod write;

pub use self::reader::{with_reader, with_sealed_reader, Reader};
pub use self::subsystem::{init, ThatchSubsystem};
pub use self::write::{
    commit_skip, region_new, region_release, reserve_skip, seal, write_data, write_tag,
    write_tagged_bytes,
};
