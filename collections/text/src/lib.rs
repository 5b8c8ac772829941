// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Copy-on-write text rope over tagged 32-bit handles.
//!
//! A [`Text`] is a shared wrapper around a handle sequence: clones bump a
//! refcount and every write path detaches first, so mutation is invisible
//! to other holders. The sequence itself lives in arena nodes, so content
//! reads resolve through the owning environment. Elements are
//! [`sapling_shared::Handle`]s — bare code points, ids into a
//! [`LiteralTable`] (deduplicated UTF-8 byte strings), or ids into a
//! [`TreeRegistry`] (whole shared texts). The [`Resolver`] expands literal
//! and tree handles back into code points with cycle and budget guards.
//!
//! UTF-8 handling is strict in both directions: overlong forms, surrogate
//! code points and values past U+10FFFF are rejected on input, and
//! encoding always emits the minimal form.

mod literal;
mod registry;
mod resolve;
mod text;

pub use self::literal::LiteralTable;
pub use self::registry::TreeRegistry;
pub use self::resolve::{LiteralSource, Resolver, ResolverLimits, TreeSource};
pub use self::text::Text;
