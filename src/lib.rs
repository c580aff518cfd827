// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![warn(missing_docs)]
#![recursion_limit = "1024"]

//! Hickory DNS Zone is the zone-lifecycle core for an authoritative server.
//!
//! It owns everything between "the zone exists" and "queries see the latest
//! version": refresh/retry/expire scheduling against a master, an on-disk
//! changeset journal with transactional semantics, atomic zonefile flushes,
//! RFC 2136 dynamic updates, DNSSEC re-sign scheduling, and the reader-safe
//! protocol by which new zone contents replace the live ones without
//! blocking concurrent lookups.
//!
//! The DNS record model and codec come from `hickory-proto`; wire parsing,
//! actual transfers, signing primitives, and TSIG MACs are external
//! collaborators consumed through the contracts in [`xfer`], [`sign`], and
//! [`tsig`].

pub use hickory_proto as proto;

pub mod catalog;
pub mod changeset;
pub mod config;
pub mod content;
pub mod error;
pub mod events;
pub mod journal;
pub mod serial;
pub mod sign;
pub mod tsig;
pub mod update;
pub mod xfer;
pub mod zone;
pub mod zonefile;

pub use catalog::Catalog;
pub use changeset::{Changeset, ChangesetBatch};
pub use config::{SerialPolicy, ZoneConfig};
pub use content::ZoneContents;
pub use error::{PersistenceError, PersistenceErrorKind, ZoneError, ZoneErrorKind};
pub use events::EventCtx;
pub use journal::Journal;
pub use serial::{JournalKey, SerialNumber};
pub use sign::{Signer, SoaSerialPolicy};
pub use tsig::{TsigVerdict, TsigVerifier};
pub use update::{UpdateOp, UpdateRequest, UpdateResult};
pub use xfer::{TaskType, TransferState, TransferTask, XfrQueue};
pub use zone::{FlushOutcome, Zone};
