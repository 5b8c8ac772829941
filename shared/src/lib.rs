// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Types shared by every Sapling crate: the wire-stable error taxonomy and
//! the tagged 32-bit element handle stored in sequences.

mod error;
mod handle;

pub use self::error::{Error, ErrorCode, Result};
pub use self::handle::{Handle, HandleKind};
