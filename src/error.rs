// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! All defined errors for zone management, journaling, and updates

use std::{fmt, io};

use thiserror::Error;

use crate::proto::error::ProtoError;

/// An alias for results returned by persistence functions of this crate
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// An alias for results returned by zone-level functions of this crate
pub type ZoneResult<T> = Result<T, ZoneError>;

/// The error kind for journal and zonefile persistence errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceErrorKind {
    /// The journal has no space left for the entry, even after evicting
    /// all clean entries. The caller should flush the zonefile and retry.
    #[error("journal is full")]
    Full,

    /// The requested changeset history is not fully present in the journal
    #[error("requested changeset history is not fully present")]
    Range,

    /// Another transaction is already open on this journal
    #[error("a journal transaction is already open")]
    TransactionBusy,

    /// A journal entry or changeset failed to decode
    #[error("malformed changeset data: {0}")]
    Malformed(&'static str),

    /// The number of bytes written didn't match the reserved region
    #[error("wrong write size: {got} expect: {expect}")]
    WrongWriteSize {
        /// The number of bytes handed back at unmap
        got: usize,
        /// The number of bytes reserved at map
        expect: usize,
    },

    /// The number of inserted rows didn't match the expected amount
    #[error("wrong insert count: {got} expect: {expect}")]
    WrongInsertCount {
        /// The number of inserted rows
        got: usize,
        /// The number of rows expected to be inserted
        expect: usize,
    },

    /// An error occurred while replaying the journal into a zone
    #[error("error recovering from journal: {0}")]
    Recovery(&'static str),

    // foreign
    /// An error got returned from IO
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An error got returned by the hickory-proto crate
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),

    /// An error got returned from the rusqlite crate
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// The error type for journal and zonefile persistence errors
#[derive(Debug)]
pub struct PersistenceError {
    kind: Box<PersistenceErrorKind>,
}

impl PersistenceError {
    /// Get the kind of the error
    pub fn kind(&self) -> &PersistenceErrorKind {
        &self.kind
    }

    /// Returns true if the journal signalled it is out of space
    pub fn is_full(&self) -> bool {
        matches!(*self.kind, PersistenceErrorKind::Full)
    }

    /// Returns true if the requested history was not fully present
    pub fn is_range(&self) -> bool {
        matches!(*self.kind, PersistenceErrorKind::Range)
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}", self.kind))
    }
}

impl std::error::Error for PersistenceError {}

impl<E> From<E> for PersistenceError
where
    E: Into<PersistenceErrorKind>,
{
    fn from(error: E) -> Self {
        Self {
            kind: Box::new(error.into()),
        }
    }
}

/// The error kind for zone lifecycle and update pipeline errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ZoneErrorKind {
    /// A caller handed in something unusable
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The two content trees are identical, there is no difference to record
    #[error("zone contents are identical, no difference")]
    NoDiff,

    /// The new serial does not advance the old one in RFC 1982 order
    #[error("serial regression: old {old} new {new}")]
    SerialRegression {
        /// Serial of the currently published contents
        old: u32,
        /// Serial that failed to advance it
        new: u32,
    },

    /// An operation of the same kind is already pending for this zone
    #[error("operation already pending")]
    Busy,

    /// This server is not authoritative for the zone, or the zone is a stub
    #[error("not authoritative for zone")]
    NotAuthoritative,

    /// The zone signer rejected or failed the signing operation
    #[error("signer error: {0}")]
    Signer(String),

    // foreign
    /// An error got returned from IO
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An error got returned by the hickory-proto crate
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),

    /// An error bubbled up from the journal or zonefile persistence layer
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// The error type for zone lifecycle and update pipeline errors
#[derive(Debug)]
pub struct ZoneError {
    kind: Box<ZoneErrorKind>,
}

impl ZoneError {
    /// Get the kind of the error
    pub fn kind(&self) -> &ZoneErrorKind {
        &self.kind
    }
}

impl fmt::Display for ZoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}", self.kind))
    }
}

impl std::error::Error for ZoneError {}

impl<E> From<E> for ZoneError
where
    E: Into<ZoneErrorKind>,
{
    fn from(error: E) -> Self {
        Self {
            kind: Box::new(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_detection() {
        let err = PersistenceError::from(PersistenceErrorKind::Full);
        assert!(err.is_full());
        assert!(!err.is_range());
    }

    #[test]
    fn test_persistence_to_zone_error() {
        let err: ZoneError = PersistenceError::from(PersistenceErrorKind::Range).into();
        match err.kind() {
            ZoneErrorKind::Persistence(p) => assert!(p.is_range()),
            kind => panic!("unexpected kind: {kind:?}"),
        }
    }
}
