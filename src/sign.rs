// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The DNSSEC signer as seen by the zone core

use crate::changeset::Changeset;
use crate::content::ZoneContents;
use crate::error::ZoneResult;

/// Whether the signer takes over the serial of the produced version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoaSerialPolicy {
    /// The serial was already advanced by the caller (e.g. a dynamic
    /// update); the signing changeset starts and ends at `new_serial`
    Keep,
    /// The signer advances the zone from its current serial to `new_serial`
    Update,
}

/// Signing primitives consumed by the zone core.
///
/// Keys, algorithms, and canonical form are the implementation's business;
/// the core only drives when signing happens, merges the resulting changeset
/// into the zone history, and schedules the next pass at the returned
/// `refresh_at` wall-clock second.
pub trait Signer: Send + Sync {
    /// Signs the whole zone, writing all changes (new RRSIGs, NSEC chain
    /// maintenance, the SOA) into `out`.
    ///
    /// Returns the wall-clock second at which signatures need refreshing;
    /// `0` means the signer has no preference.
    fn sign_zone(
        &self,
        contents: &ZoneContents,
        policy: SoaSerialPolicy,
        new_serial: u32,
        out: &mut Changeset,
    ) -> ZoneResult<u64>;

    /// Signs only the records touched by `user_changeset`, writing the new
    /// signatures into `out`.
    fn sign_changeset(
        &self,
        contents: &ZoneContents,
        user_changeset: &Changeset,
        policy: SoaSerialPolicy,
        new_serial: u32,
        out: &mut Changeset,
    ) -> ZoneResult<u64>;
}

/// A signer for zones without DNSSEC: produces no signatures and never asks
/// to be rescheduled
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSigner;

impl Signer for NullSigner {
    fn sign_zone(
        &self,
        _contents: &ZoneContents,
        _policy: SoaSerialPolicy,
        _new_serial: u32,
        _out: &mut Changeset,
    ) -> ZoneResult<u64> {
        Ok(0)
    }

    fn sign_changeset(
        &self,
        _contents: &ZoneContents,
        _user_changeset: &Changeset,
        _policy: SoaSerialPolicy,
        _new_serial: u32,
        _out: &mut Changeset,
    ) -> ZoneResult<u64> {
        Ok(0)
    }
}
