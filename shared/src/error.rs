// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::borrow::Cow;

use num_derive::FromPrimitive;
use thiserror::Error;

/// Flat error taxonomy shared by every subsystem. The integer values are
/// wire-stable: external callers match on them across the FFI/Wasm boundary,
/// so changing one is a breaking change.
#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, FromPrimitive)]
pub enum ErrorCode {
    Ok = 0,

    /// Arena or auxiliary allocation failed.
    Oom = 1,

    /// Bad argument, poisoned object, sealed write, or bad state.
    Invalid = 2,

    /// Key, field, or resource absent.
    NotFound = 3,

    /// Numeric bound exceeded: index, cursor, or u32 id.
    Range = 4,

    /// Operation on an empty collection.
    Empty = 5,

    /// Capacity saturated: arena full or id space exhausted.
    Full = 6,

    /// Write attempted through a read-only transaction.
    ReadOnly = 7,

    /// Resource contention surfaced by a collaborator.
    Busy = 8,

    /// Duplicate key with the no-overwrite flag.
    Exists = 9,

    /// Compare-and-swap mismatch.
    Conflict = 10,

    /// Data integrity failure.
    Corrupt = 11,

    /// Syntax error.
    Parse = 12,

    /// Wrong type for the operation.
    Type = 13,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error code: {}", *self as u32)
    }
}

/// Sapling error. One variant per taxonomy code, carrying enough context to
/// be useful in logs; [`Error::code`] projects back onto the wire value.
#[derive(Debug, Error)]
pub enum Error {
    #[error("allocation failed: {0}")]
    Oom(&'static str),
    #[error("invalid: {0}")]
    Invalid(Cow<'static, str>),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("index {index} out of range for {what} of length {len}")]
    Range {
        what: &'static str,
        index: u64,
        len: u64,
    },
    #[error("{0} is empty")]
    Empty(&'static str),
    #[error("{0} capacity exhausted")]
    Full(&'static str),
    #[error("write attempted in a read-only transaction")]
    ReadOnly,
    #[error("busy: {0}")]
    Busy(&'static str),
    #[error("key already exists")]
    Exists,
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("corrupt: {0}")]
    Corrupt(&'static str),
    #[error("parse: {0}")]
    Parse(Cow<'static, str>),
    #[error("wrong type for operation: {0}")]
    Type(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience constructor for the most common variant.
    pub fn invalid(msg: impl Into<Cow<'static, str>>) -> Error {
        Error::Invalid(msg.into())
    }

    pub fn parse(msg: impl Into<Cow<'static, str>>) -> Error {
        Error::Parse(msg.into())
    }

    pub fn range(what: &'static str, index: u64, len: u64) -> Error {
        Error::Range { what, index, len }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Oom(_) => ErrorCode::Oom,
            Error::Invalid(_) => ErrorCode::Invalid,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Range { .. } => ErrorCode::Range,
            Error::Empty(_) => ErrorCode::Empty,
            Error::Full(_) => ErrorCode::Full,
            Error::ReadOnly => ErrorCode::ReadOnly,
            Error::Busy(_) => ErrorCode::Busy,
            Error::Exists => ErrorCode::Exists,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::Corrupt(_) => ErrorCode::Corrupt,
            Error::Parse(_) => ErrorCode::Parse,
            Error::Type(_) => ErrorCode::Type,
        }
    }
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    #[test]
    fn codes_are_wire_stable() {
        // Frozen by the external contract; a renumbering must fail here.
        assert_eq!(ErrorCode::Ok as u32, 0);
        assert_eq!(ErrorCode::Oom as u32, 1);
        assert_eq!(ErrorCode::Invalid as u32, 2);
        assert_eq!(ErrorCode::NotFound as u32, 3);
        assert_eq!(ErrorCode::Range as u32, 4);
        assert_eq!(ErrorCode::Empty as u32, 5);
        assert_eq!(ErrorCode::Full as u32, 6);
        assert_eq!(ErrorCode::ReadOnly as u32, 7);
        assert_eq!(ErrorCode::Busy as u32, 8);
        assert_eq!(ErrorCode::Exists as u32, 9);
        assert_eq!(ErrorCode::Conflict as u32, 10);
        assert_eq!(ErrorCode::Corrupt as u32, 11);
        assert_eq!(ErrorCode::Parse as u32, 12);
        assert_eq!(ErrorCode::Type as u32, 13);
    }

    #[test]
    fn round_trip_from_primitive() {
        for raw in 0..=13u32 {
            let code = ErrorCode::from_u32(raw).unwrap();
            assert_eq!(code as u32, raw);
        }
        assert!(ErrorCode::from_u32(14).is_none());
    }

    #[test]
    fn error_projects_code() {
        assert_eq!(Error::Oom("seq push").code(), ErrorCode::Oom);
        assert_eq!(Error::range("seq", 9, 3).code(), ErrorCode::Range);
        assert_eq!(Error::ReadOnly.code(), ErrorCode::ReadOnly);
        assert_eq!(
            Error::invalid("poisoned sequence").code(),
            ErrorCode::Invalid
        );
    }
}
