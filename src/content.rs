// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Immutable zone content trees

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::error;

use crate::error::{ZoneErrorKind, ZoneResult};
use crate::proto::rr::rdata::SOA;
use crate::proto::rr::{LowerName, Name, RData, Record, RecordSet, RecordType, RrKey};
use crate::serial::SerialNumber;
use crate::changeset::Changeset;

/// One version of a zone's records.
///
/// A content tree is immutable once published: every change builds a new tree
/// (sharing unchanged record sets) and swaps it in, so readers answering
/// queries keep traversing the version they captured without taking locks.
#[derive(Debug, Clone)]
pub struct ZoneContents {
    origin: LowerName,
    records: BTreeMap<RrKey, Arc<RecordSet>>,
}

impl ZoneContents {
    /// Creates a content tree from the map of initial record sets.
    ///
    /// # Arguments
    ///
    /// * `origin` - The zone `Name` being created, this should match that of
    ///   the `RecordType::SOA` record.
    /// * `records` - The map of the initial set of records in the zone.
    pub fn new(origin: Name, records: BTreeMap<RrKey, RecordSet>) -> ZoneResult<Self> {
        let origin = LowerName::from(origin);

        // SOA must be present
        if !records
            .iter()
            .any(|(key, _)| key.record_type == RecordType::SOA && key.name == origin)
        {
            return Err(ZoneErrorKind::InvalidArgument("SOA record must be present").into());
        }

        let records = records
            .into_iter()
            .map(|(key, rrset)| (key, Arc::new(rrset)))
            .collect();

        Ok(Self { origin, records })
    }

    /// Assembles a content tree from already-shared record sets; callers
    /// guarantee the SOA is present
    pub(crate) fn from_parts(
        origin: LowerName,
        records: BTreeMap<RrKey, Arc<RecordSet>>,
    ) -> Self {
        Self { origin, records }
    }

    /// The apex name of the zone
    pub fn origin(&self) -> &LowerName {
        &self.origin
    }

    /// All record sets of this version, keyed by name and type
    pub fn records(&self) -> &BTreeMap<RrKey, Arc<RecordSet>> {
        &self.records
    }

    /// The record set at the zone apex of the given type
    pub fn apex_rrset(&self, record_type: RecordType) -> Option<&Arc<RecordSet>> {
        self.records
            .get(&RrKey::new(self.origin.clone(), record_type))
    }

    /// The SOA record of this version
    pub fn soa_record(&self) -> Option<&Record> {
        self.apex_rrset(RecordType::SOA)
            .and_then(|rrset| rrset.records_without_rrsigs().next())
    }

    /// The SOA rdata of this version
    pub fn soa(&self) -> Option<&SOA> {
        self.soa_record().and_then(|record| match record.data() {
            Some(RData::SOA(soa)) => Some(soa),
            _ => None,
        })
    }

    /// The serial of this version; `0` if the SOA is unreadable
    pub fn serial(&self) -> u32 {
        match self.soa() {
            Some(soa) => soa.serial(),
            None => {
                error!("no soa record found for zone: {}", self.origin);
                0
            }
        }
    }

    /// SOA REFRESH in seconds
    pub fn soa_refresh(&self) -> Option<u32> {
        self.soa().map(|soa| soa.refresh().max(0) as u32)
    }

    /// SOA RETRY in seconds
    pub fn soa_retry(&self) -> Option<u32> {
        self.soa().map(|soa| soa.retry().max(0) as u32)
    }

    /// SOA EXPIRE in seconds
    pub fn soa_expire(&self) -> Option<u32> {
        self.soa().map(|soa| soa.expire().max(0) as u32)
    }

    /// Looks up the record set with the exact name and type
    pub fn lookup(&self, name: &LowerName, record_type: RecordType) -> Option<&Arc<RecordSet>> {
        self.records.get(&RrKey::new(name.clone(), record_type))
    }

    /// True when any record set exists at `name`
    pub fn name_exists(&self, name: &LowerName) -> bool {
        self.records.keys().any(|key| key.name == *name)
    }

    /// Builds the next version of this tree by applying a changeset.
    ///
    /// The changeset must start at this version's serial. Removals of records
    /// that are absent are ignored, as are additions of records that are
    /// already present, so a remove-then-add of the same record is a no-op.
    pub fn with_changeset(&self, changeset: &Changeset) -> ZoneResult<Self> {
        if changeset.serial_from() != Some(self.serial()) {
            return Err(ZoneErrorKind::InvalidArgument(
                "changeset does not start at the current zone version",
            )
            .into());
        }

        let new_soa = changeset
            .soa_to()
            .cloned()
            .ok_or(ZoneErrorKind::InvalidArgument("changeset has no resulting SOA"))?;
        if LowerName::from(new_soa.name()) != self.origin {
            return Err(ZoneErrorKind::InvalidArgument(
                "changeset SOA does not belong to this zone",
            )
            .into());
        }
        let new_serial = changeset
            .serial_to()
            .ok_or(ZoneErrorKind::InvalidArgument("changeset has no resulting SOA"))?;

        let mut records = self.records.clone();

        for rrset in changeset.removes() {
            // the SOA swap is handled once at the end
            if rrset.record_type() == RecordType::SOA {
                continue;
            }

            let key = RrKey::new(LowerName::from(rrset.name()), rrset.record_type());
            if let Some(existing) = records.get_mut(&key) {
                let mut modified = RecordSet::clone(existing);
                for record in rrset.records_without_rrsigs() {
                    modified.remove(record, new_serial);
                }

                if modified.is_empty() {
                    records.remove(&key);
                } else {
                    *existing = Arc::new(modified);
                }
            }
        }

        for rrset in changeset.adds() {
            if rrset.record_type() == RecordType::SOA {
                continue;
            }

            let key = RrKey::new(LowerName::from(rrset.name()), rrset.record_type());
            let name = rrset.name().clone();
            let record_type = rrset.record_type();

            let existing = records
                .entry(key)
                .or_insert_with(|| Arc::new(RecordSet::new(&name, record_type, new_serial)));
            let mut modified = RecordSet::clone(existing);
            for record in rrset.records_without_rrsigs() {
                modified.insert(record.clone(), new_serial);
            }
            *existing = Arc::new(modified);
        }

        // install the resulting SOA
        let soa_name = Name::from(self.origin.clone());
        let mut soa_rrset = RecordSet::new(&soa_name, RecordType::SOA, new_serial);
        soa_rrset.insert(new_soa, new_serial);
        records.insert(
            RrKey::new(self.origin.clone(), RecordType::SOA),
            Arc::new(soa_rrset),
        );

        Ok(Self {
            origin: self.origin.clone(),
            records,
        })
    }
}

/// Computes the changeset that transforms `old` into `new`.
///
/// Differences are recorded with whole-record-set granularity: a record set
/// that changed is removed in its old form and added in its new form.
pub fn diff(old: &ZoneContents, new: &ZoneContents) -> ZoneResult<Changeset> {
    let old_serial = old.serial();
    let new_serial = new.serial();

    match SerialNumber(old_serial).partial_cmp(&SerialNumber(new_serial)) {
        Some(std::cmp::Ordering::Less) => {}
        Some(std::cmp::Ordering::Equal) => return Err(ZoneErrorKind::NoDiff.into()),
        _ => {
            return Err(ZoneErrorKind::SerialRegression {
                old: old_serial,
                new: new_serial,
            }
            .into())
        }
    }

    diff_any(old, new)
}

/// Computes the changeset between two versions without requiring the serial
/// to advance: a dynamic update under the unixtime serial policy may move
/// the serial backwards and is applied regardless.
pub(crate) fn diff_any(old: &ZoneContents, new: &ZoneContents) -> ZoneResult<Changeset> {
    let old_soa = old
        .soa_record()
        .ok_or(ZoneErrorKind::InvalidArgument("old contents have no SOA"))?;
    let new_soa = new
        .soa_record()
        .ok_or(ZoneErrorKind::InvalidArgument("new contents have no SOA"))?;

    let mut changeset = Changeset::with_soa(old_soa.clone(), new_soa.clone());

    for (key, rrset) in old.records() {
        if key.record_type == RecordType::SOA {
            continue;
        }

        match new.records().get(key) {
            Some(counterpart) if rrsets_equal(counterpart, rrset) => {}
            _ => changeset.push_remove(RecordSet::clone(rrset)),
        }
    }

    for (key, rrset) in new.records() {
        if key.record_type == RecordType::SOA {
            continue;
        }

        match old.records().get(key) {
            Some(counterpart) if rrsets_equal(counterpart, rrset) => {}
            _ => changeset.push_add(RecordSet::clone(rrset)),
        }
    }

    Ok(changeset)
}

/// Compares two record sets by owner, type, ttl, and records, ignoring
/// bookkeeping such as the serial a set was last modified at
pub(crate) fn rrsets_equal(a: &RecordSet, b: &RecordSet) -> bool {
    a.name() == b.name()
        && a.record_type() == b.record_type()
        && a.ttl() == b.ttl()
        && a.records_without_rrsigs().count() == b.records_without_rrsigs().count()
        && a.records_without_rrsigs()
            .all(|record| b.records_without_rrsigs().any(|other| other == record))
}

/// True when the record set of the given type at the zone apex differs
/// between the two versions, compared for whole-record-set equality.
///
/// Used to decide between a full zone resign and signing just the changed
/// records when a dynamic update touched DNSKEY or NSEC3PARAM.
pub fn apex_rrset_changed(old: &ZoneContents, new: &ZoneContents, record_type: RecordType) -> bool {
    match (old.apex_rrset(record_type), new.apex_rrset(record_type)) {
        (None, None) => false,
        (Some(old_rr), Some(new_rr)) => !rrsets_equal(old_rr, new_rr),
        _ => true,
    }
}
