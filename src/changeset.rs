// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Incremental zone differences and their binary form

use crate::error::{
    PersistenceError, PersistenceErrorKind, PersistenceResult, ZoneError, ZoneErrorKind,
};
use crate::proto::error::ProtoError;
use crate::proto::rr::{RData, Record, RecordSet, RecordType};
use crate::proto::serialize::binary::{BinDecodable, BinDecoder, BinEncodable, BinEncoder};

/// A single difference between two consecutive versions of a zone.
///
/// A changeset moves a zone from the version identified by `soa_from` to the
/// version identified by `soa_to` by first removing the record sets of the
/// remove list and then adding the record sets of the add list. Applying a
/// remove-then-add of the same record must be a no-op for the apply logic, so
/// a changeset is free to mention a record on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    soa_from: Option<Record>,
    soa_to: Option<Record>,
    remove: Vec<RecordSet>,
    add: Vec<RecordSet>,
    /// Free-form flags word, folded on merge and preserved across
    /// serialization
    pub flags: u32,
}

fn soa_serial(record: &Record) -> Option<u32> {
    match record.data() {
        Some(RData::SOA(soa)) => Some(soa.serial()),
        _ => None,
    }
}

impl Changeset {
    /// Creates an empty changeset with no endpoints assigned yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a changeset between the two SOA records
    pub fn with_soa(soa_from: Record, soa_to: Record) -> Self {
        Self {
            soa_from: Some(soa_from),
            soa_to: Some(soa_to),
            ..Self::default()
        }
    }

    /// The SOA record of the version this changeset starts from
    pub fn soa_from(&self) -> Option<&Record> {
        self.soa_from.as_ref()
    }

    /// The SOA record of the version this changeset produces
    pub fn soa_to(&self) -> Option<&Record> {
        self.soa_to.as_ref()
    }

    /// Assigns the starting SOA
    pub fn set_soa_from(&mut self, soa: Record) {
        debug_assert!(soa.record_type() == RecordType::SOA);
        self.soa_from = Some(soa);
    }

    /// Assigns the resulting SOA
    pub fn set_soa_to(&mut self, soa: Record) {
        debug_assert!(soa.record_type() == RecordType::SOA);
        self.soa_to = Some(soa);
    }

    /// Serial of the version this changeset starts from
    pub fn serial_from(&self) -> Option<u32> {
        self.soa_from.as_ref().and_then(soa_serial)
    }

    /// Serial of the version this changeset produces
    pub fn serial_to(&self) -> Option<u32> {
        self.soa_to.as_ref().and_then(soa_serial)
    }

    /// Record sets removed by this changeset, in insertion order
    pub fn removes(&self) -> &[RecordSet] {
        &self.remove
    }

    /// Record sets added by this changeset, in insertion order
    pub fn adds(&self) -> &[RecordSet] {
        &self.add
    }

    /// Appends a record set to the remove list
    pub fn push_remove(&mut self, rrset: RecordSet) {
        self.remove.push(rrset);
    }

    /// Appends a record set to the add list
    pub fn push_add(&mut self, rrset: RecordSet) {
        self.add.push(rrset);
    }

    /// True when the changeset carries no record changes. A changeset that
    /// only rewrites the SOA counts as empty and is not worth journaling.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }

    /// Merges `other` into `self`.
    ///
    /// `other` must continue where `self` ends: `self.serial_to()` has to
    /// equal `other.serial_from()`. The merged changeset keeps `self`'s
    /// starting SOA, takes `other`'s resulting SOA, and concatenates both
    /// remove and add lists without compacting duplicates.
    pub fn merge(&mut self, other: Changeset) -> Result<(), ZoneError> {
        match (self.serial_to(), other.serial_from()) {
            (Some(to), Some(from)) if to == from => {}
            _ => {
                return Err(ZoneErrorKind::InvalidArgument(
                    "changesets do not form a chain",
                )
                .into())
            }
        }

        self.remove.extend(other.remove);
        self.add.extend(other.add);
        self.soa_to = other.soa_to;
        self.flags |= other.flags;
        Ok(())
    }

    /// Serializes the changeset into its journal entry form.
    ///
    /// Layout: a 32-bit flags word, the starting SOA record set, every record
    /// set of the remove list, the resulting SOA record set, every record set
    /// of the add list. The second SOA doubles as the section delimiter on
    /// read.
    pub fn to_bytes(&self) -> PersistenceResult<Vec<u8>> {
        let soa_from = self
            .soa_from
            .as_ref()
            .ok_or(PersistenceErrorKind::Malformed("changeset has no starting SOA"))?;
        let soa_to = self
            .soa_to
            .as_ref()
            .ok_or(PersistenceErrorKind::Malformed("changeset has no resulting SOA"))?;

        let mut buf = Vec::with_capacity(512);
        {
            let mut encoder = BinEncoder::new(&mut buf);
            encoder.emit_u32(self.flags)?;

            emit_records(&mut encoder, std::iter::once(soa_from))?;
            for rrset in &self.remove {
                emit_records(&mut encoder, rrset.records_without_rrsigs())?;
            }
            emit_records(&mut encoder, std::iter::once(soa_to))?;
            for rrset in &self.add {
                emit_records(&mut encoder, rrset.records_without_rrsigs())?;
            }
        }

        Ok(buf)
    }

    /// Size of the serialized form, used to reserve journal space
    pub fn binary_size(&self) -> PersistenceResult<usize> {
        self.to_bytes().map(|bytes| bytes.len())
    }

    /// Deserializes a changeset from its journal entry form, see
    /// [`Changeset::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> PersistenceResult<Self> {
        let mut decoder = BinDecoder::new(bytes);
        let flags = decoder.read_u32().map_err(ProtoError::from)?.unverified();

        let leading = read_rrset(&mut decoder)?;
        if leading.record_type() != RecordType::SOA {
            return Err(PersistenceErrorKind::Malformed("changeset does not start with SOA").into());
        }
        let soa_from = first_record(&leading)?;

        let mut changeset = Self {
            soa_from: Some(soa_from),
            flags,
            ..Self::default()
        };

        let mut in_remove_section = true;
        while !decoder.is_empty() {
            let rrset = read_rrset(&mut decoder)?;

            if rrset.record_type() == RecordType::SOA {
                if in_remove_section {
                    changeset.soa_to = Some(first_record(&rrset)?);
                    in_remove_section = false;
                } else {
                    // a third SOA terminates the changeset
                    break;
                }
            } else if in_remove_section {
                changeset.remove.push(rrset);
            } else {
                changeset.add.push(rrset);
            }
        }

        if changeset.soa_to.is_none() {
            return Err(PersistenceErrorKind::Malformed("changeset has no resulting SOA").into());
        }

        Ok(changeset)
    }
}

fn emit_records<'a>(
    encoder: &mut BinEncoder<'_>,
    records: impl Iterator<Item = &'a Record>,
) -> PersistenceResult<()> {
    let records: Vec<&Record> = records.collect();
    if records.len() > usize::from(u16::MAX) {
        return Err(PersistenceErrorKind::Malformed("record set too large").into());
    }

    encoder.emit_u16(records.len() as u16)?;
    for record in records {
        record.emit(encoder)?;
    }
    Ok(())
}

fn read_rrset(decoder: &mut BinDecoder<'_>) -> PersistenceResult<RecordSet> {
    let count = decoder.read_u16().map_err(ProtoError::from)?.unverified();
    if count == 0 {
        return Err(PersistenceErrorKind::Malformed("empty record set").into());
    }

    let first = Record::read(decoder)?;
    let name = first.name().clone();
    let mut rrset = RecordSet::new(&name, first.record_type(), 0);
    rrset.insert(first, 0);

    for _ in 1..count {
        let record = Record::read(decoder)?;
        if record.record_type() != rrset.record_type() || record.name() != rrset.name() {
            return Err(
                PersistenceErrorKind::Malformed("record set changed identity mid-way").into(),
            );
        }
        rrset.insert(record, 0);
    }

    Ok(rrset)
}

fn first_record(rrset: &RecordSet) -> Result<Record, PersistenceError> {
    rrset
        .records_without_rrsigs()
        .next()
        .cloned()
        .ok_or_else(|| PersistenceErrorKind::Malformed("empty record set").into())
}

/// An ordered sequence of changesets forming a contiguous history: each
/// changeset starts at the serial the previous one produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesetBatch {
    sets: Vec<Changeset>,
}

impl ChangesetBatch {
    /// Creates an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a changeset, enforcing the chain invariant against the last
    /// changeset already in the batch
    pub fn push(&mut self, changeset: Changeset) -> Result<(), ZoneError> {
        if let Some(last) = self.sets.last() {
            match (last.serial_to(), changeset.serial_from()) {
                (Some(to), Some(from)) if to == from => {}
                _ => {
                    return Err(ZoneErrorKind::InvalidArgument(
                        "changeset does not continue the batch",
                    )
                    .into())
                }
            }
        }

        self.sets.push(changeset);
        Ok(())
    }

    /// True when the batch holds no changesets, or only empty ones
    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(Changeset::is_empty)
    }

    /// Number of changesets in the batch
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Iterates the changesets in history order
    pub fn iter(&self) -> impl Iterator<Item = &Changeset> {
        self.sets.iter()
    }

    /// The last changeset of the batch
    pub fn last(&self) -> Option<&Changeset> {
        self.sets.last()
    }

    /// Serial the whole batch starts from
    pub fn serial_from(&self) -> Option<u32> {
        self.sets.first().and_then(Changeset::serial_from)
    }

    /// Serial the whole batch ends at
    pub fn serial_to(&self) -> Option<u32> {
        self.sets.last().and_then(Changeset::serial_to)
    }
}

impl From<Changeset> for ChangesetBatch {
    fn from(changeset: Changeset) -> Self {
        Self {
            sets: vec![changeset],
        }
    }
}

impl IntoIterator for ChangesetBatch {
    type Item = Changeset;
    type IntoIter = std::vec::IntoIter<Changeset>;

    fn into_iter(self) -> Self::IntoIter {
        self.sets.into_iter()
    }
}
