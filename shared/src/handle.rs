// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use static_assertions::const_assert_eq;

use crate::{Error, Result};

/// Tag bits occupy bits 31-30 of a handle; the payload the low 30.
const TAG_SHIFT: u32 = 30;
const TAG_MASK: u32 = 0b11 << TAG_SHIFT;

/// Maximum payload representable in the low 30 bits.
pub(crate) const PAYLOAD_MASK: u32 = (1 << TAG_SHIFT) - 1;

const TAG_CODEPOINT: u32 = 0b00;
const TAG_LITERAL: u32 = 0b01;
const TAG_TREE: u32 = 0b10;
const TAG_RESERVED: u32 = 0b11;

// Every Unicode scalar value fits the payload, so a CODEPOINT handle's raw
// form equals the code point itself. External callers rely on this.
const_assert_eq!(TAG_CODEPOINT << TAG_SHIFT, 0);
const_assert_eq!(PAYLOAD_MASK, 0x3FFF_FFFF);

/// The element kind encoded in a handle's tag bits. The fourth tag value is
/// reserved and never observable through a constructed [`Handle`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum HandleKind {
    /// A Unicode scalar value.
    Codepoint,
    /// An id into a literal table.
    Literal,
    /// An id into a tree registry.
    Tree,
}

/// A tagged 32-bit element handle: 2 tag bits and a 30-bit payload. This is
/// the exact value stored in a sequence, observable across subsystem
/// boundaries, so the packing is part of the external contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Handle for a Unicode scalar value. Infallible: `char` is exactly the
    /// set of storable code points (no surrogates, max U+10FFFF).
    pub fn codepoint(c: char) -> Handle {
        Handle(c as u32)
    }

    /// Handle for a literal-table id. The id must fit the 30-bit payload.
    pub fn literal(id: u32) -> Result<Handle> {
        Self::tagged(TAG_LITERAL, id)
    }

    /// Handle for a tree-registry id. The id must fit the 30-bit payload.
    pub fn tree(id: u32) -> Result<Handle> {
        Self::tagged(TAG_TREE, id)
    }

    fn tagged(tag: u32, payload: u32) -> Result<Handle> {
        if payload > PAYLOAD_MASK {
            return Err(Error::range("handle payload", payload as u64, (PAYLOAD_MASK + 1) as u64));
        }
        Ok(Handle((tag << TAG_SHIFT) | payload))
    }

    /// Validate a raw 32-bit value as a storable handle: the reserved tag is
    /// rejected, and CODEPOINT payloads must be scalar values.
    pub fn from_raw(raw: u32) -> Result<Handle> {
        match raw >> TAG_SHIFT {
            TAG_RESERVED => Err(Error::invalid("reserved handle tag")),
            TAG_CODEPOINT => match char::from_u32(raw & PAYLOAD_MASK) {
                Some(_) => Ok(Handle(raw)),
                None => Err(Error::invalid("handle payload is not a Unicode scalar value")),
            },
            _ => Ok(Handle(raw)),
        }
    }

    /// The raw wire form.
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn kind(self) -> HandleKind {
        match self.0 >> TAG_SHIFT {
            TAG_CODEPOINT => HandleKind::Codepoint,
            TAG_LITERAL => HandleKind::Literal,
            TAG_TREE => HandleKind::Tree,
            // Constructors never produce the reserved tag.
            _ => unreachable!("reserved tag in constructed handle"),
        }
    }

    pub fn payload(self) -> u32 {
        self.0 & PAYLOAD_MASK
    }

    /// The code point, if this is a CODEPOINT handle.
    pub fn as_char(self) -> Option<char> {
        match self.kind() {
            // Payload was validated at construction.
            HandleKind::Codepoint => char::from_u32(self.payload()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            HandleKind::Codepoint => match self.as_char() {
                Some(c) => write!(f, "Codepoint({:?})", c),
                None => write!(f, "Codepoint(U+{:06X})", self.payload()),
            },
            HandleKind::Literal => write!(f, "Literal({})", self.payload()),
            HandleKind::Tree => write!(f, "Tree({})", self.payload()),
        }
    }
}
