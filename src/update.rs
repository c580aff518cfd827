// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The dynamic update pipeline, [RFC 2136](https://tools.ietf.org/html/rfc2136)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::changeset::{Changeset, ChangesetBatch};
use crate::content::{self, ZoneContents};
use crate::error::{ZoneErrorKind, ZoneResult};
use crate::events::{self, EventCtx};
use crate::proto::op::ResponseCode;
use crate::proto::rr::rdata::SOA;
use crate::proto::rr::{LowerName, Name, RData, Record, RecordSet, RecordType, RrKey};
use crate::serial::{next_serial, SerialNumber};
use crate::sign::SoaSerialPolicy;
use crate::zone::Zone;

/// An alias for the pipeline results answered to clients as an RCODE
pub type UpdateResult<T> = Result<T, ResponseCode>;

/// A single assertion from the prerequisite section of an update,
/// [RFC 2136](https://tools.ietf.org/html/rfc2136) section 3.2
///
/// ```text
/// 3.2.4 - Table Of Metavalues Used In Prerequisite Section
///
///   CLASS    TYPE     RDATA    Meaning
///   ------------------------------------------------------------
///   ANY      ANY      empty    Name is in use
///   ANY      rrset    empty    RRset exists (value independent)
///   NONE     ANY      empty    Name is not in use
///   NONE     rrset    empty    RRset does not exist
///   zone     rrset    rr       RRset exists (value dependent)
/// ```
#[derive(Debug, Clone)]
pub enum Prerequisite {
    /// At least one record set exists at the name
    NameInUse(Name),
    /// No record set exists at the name
    NameNotInUse(Name),
    /// A record set of the type exists at the name, value independent
    RrsetExists {
        /// Owner of the required record set
        name: Name,
        /// Type of the required record set
        rtype: RecordType,
    },
    /// No record set of the type exists at the name
    RrsetNotExists {
        /// Owner of the forbidden record set
        name: Name,
        /// Type of the forbidden record set
        rtype: RecordType,
    },
    /// A record set exists and matches exactly, value dependent
    RrsetEquals(RecordSet),
}

/// A single operation from the update section of an update,
/// [RFC 2136](https://tools.ietf.org/html/rfc2136) section 3.4.2
///
/// ```text
/// 3.4.2.6 - Table Of Metavalues Used In Update Section
///
///   CLASS    TYPE     RDATA    Meaning
///   ---------------------------------------------------------
///   ANY      ANY      empty    Delete all RRsets from a name
///   ANY      rrset    empty    Delete an RRset
///   NONE     rrset    rr       Delete an RR from an RRset
///   zone     rrset    rr       Add to an RRset
/// ```
#[derive(Debug, Clone)]
pub enum UpdateOp {
    /// Add the record to its record set
    Add(Record),
    /// Delete the whole record set of the name and type
    DeleteRrset {
        /// Owner of the record set to delete
        name: Name,
        /// Type of the record set to delete
        rtype: RecordType,
    },
    /// Delete every record set at the name
    DeleteName(Name),
    /// Delete the one record matching name, type, and rdata
    Delete(Record),
}

/// A dynamic update bound to a zone, already parsed from the wire and
/// TSIG-verified by the caller
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Assertions that must hold against the current zone version
    pub prerequisites: Vec<Prerequisite>,
    /// Operations to apply, in order
    pub updates: Vec<UpdateOp>,
    /// Peer the update came from, for logging and ACL checks
    pub peer: SocketAddr,
    /// Name of the TSIG key the update was signed with
    pub key_name: Option<String>,
}

/// Checks that all prerequisites are satisfied by the current state of the
/// zone, [RFC 2136](https://tools.ietf.org/html/rfc2136) section 3.2
pub fn verify_prerequisites(
    contents: &ZoneContents,
    prerequisites: &[Prerequisite],
) -> UpdateResult<()> {
    let origin = contents.origin();

    for require in prerequisites {
        let name = match require {
            Prerequisite::NameInUse(name) | Prerequisite::NameNotInUse(name) => name,
            Prerequisite::RrsetExists { name, .. } | Prerequisite::RrsetNotExists { name, .. } => {
                name
            }
            Prerequisite::RrsetEquals(rrset) => rrset.name(),
        };

        let lower = LowerName::from(name);
        if !origin.zone_of(&lower) {
            warn!("{name} is not a zone_of {origin}");
            return Err(ResponseCode::NotZone);
        }

        match require {
            // ANY      ANY      empty    Name is in use
            Prerequisite::NameInUse(_) => {
                if !contents.name_exists(&lower) {
                    return Err(ResponseCode::NXDomain);
                }
            }
            // NONE     ANY      empty    Name is not in use
            Prerequisite::NameNotInUse(_) => {
                if contents.name_exists(&lower) {
                    return Err(ResponseCode::YXDomain);
                }
            }
            // ANY      rrset    empty    RRset exists (value independent)
            Prerequisite::RrsetExists { rtype, .. } => {
                if contents.lookup(&lower, *rtype).is_none() {
                    return Err(ResponseCode::NXRRSet);
                }
            }
            // NONE     rrset    empty    RRset does not exist
            Prerequisite::RrsetNotExists { rtype, .. } => {
                if contents.lookup(&lower, *rtype).is_some() {
                    return Err(ResponseCode::YXRRSet);
                }
            }
            // zone     rrset    rr       RRset exists (value dependent)
            Prerequisite::RrsetEquals(required) => {
                let found = contents
                    .lookup(&lower, required.record_type())
                    .ok_or(ResponseCode::NXRRSet)?;
                if !rrset_rdata_equal(found, required) {
                    return Err(ResponseCode::NXRRSet);
                }
            }
        }
    }

    // if we didn't bail everything checked out...
    Ok(())
}

/// Set equality of two record sets by rdata alone; prerequisite records
/// carry zeroed TTLs, which are ignored in the comparison
fn rrset_rdata_equal(zone_rrset: &RecordSet, required: &RecordSet) -> bool {
    let zone_rdatas: Vec<_> = zone_rrset
        .records_without_rrsigs()
        .filter_map(Record::data)
        .collect();
    let required_rdatas: Vec<_> = required
        .records_without_rrsigs()
        .filter_map(Record::data)
        .collect();

    zone_rdatas.len() == required_rdatas.len()
        && required_rdatas
            .iter()
            .all(|rdata| zone_rdatas.contains(rdata))
}

/// Prescan of the update section, [RFC 2136](https://tools.ietf.org/html/rfc2136)
/// section 3.4.1: every operation must stay inside the zone and use a real
/// record type
pub fn pre_scan(contents: &ZoneContents, updates: &[UpdateOp]) -> UpdateResult<()> {
    let origin = contents.origin();

    for op in updates {
        let (name, rtype) = match op {
            UpdateOp::Add(record) => (record.name(), Some(record.record_type())),
            UpdateOp::Delete(record) => (record.name(), Some(record.record_type())),
            UpdateOp::DeleteRrset { name, rtype } => (name, Some(*rtype)),
            UpdateOp::DeleteName(name) => (name, None),
        };

        if !origin.zone_of(&LowerName::from(name)) {
            return Err(ResponseCode::NotZone);
        }

        if let Some(rtype) = rtype {
            match rtype {
                RecordType::ANY | RecordType::AXFR | RecordType::IXFR => {
                    return Err(ResponseCode::FormErr);
                }
                _ => (),
            }
        }
    }

    Ok(())
}

/// Applies the update operations to the current contents, producing the next
/// version at `new_serial`.
///
/// Returns `None` when no operation changed anything.
///
/// ```text
/// 3.4.2.3. For any Update RR whose CLASS is ANY and whose TYPE is ANY,
///   all Zone RRs with the same NAME are deleted, unless the NAME is the
///   same as ZNAME in which case only those RRs whose TYPE is other than
///   SOA or NS are deleted. ...
///
/// 3.4.2.4. For any Update RR whose class is NONE, any Zone RR whose
///   NAME, TYPE, RDATA and RDLENGTH are equal to the Update RR is deleted,
///   unless the NAME is the same as ZNAME and either the TYPE is SOA or
///   the TYPE is NS and the matching Zone RR is the only NS remaining in
///   the RRset, in which case this Update RR is ignored.
/// ```
pub fn apply_update_records(
    old: &ZoneContents,
    updates: &[UpdateOp],
    new_serial: u32,
) -> UpdateResult<Option<ZoneContents>> {
    let origin = old.origin().clone();
    let origin_name = Name::from(origin.clone());
    let mut records = old.records().clone();
    let mut updated = false;

    for op in updates {
        match op {
            // zone     rrset    rr       Add to an RRset
            UpdateOp::Add(record) => {
                info!("upserting record: {:?}", record);
                let key = RrKey::new(LowerName::from(record.name()), record.record_type());
                let rr_name = record.name().clone();
                let rr_type = record.record_type();

                let entry = records
                    .entry(key)
                    .or_insert_with(|| Arc::new(RecordSet::new(&rr_name, rr_type, new_serial)));
                let mut modified = RecordSet::clone(entry);
                if modified.insert(record.clone(), new_serial) {
                    *entry = Arc::new(modified);
                    updated = true;
                }
            }
            // ANY      ANY      empty    Delete all RRsets from a name
            UpdateOp::DeleteName(name) => {
                let lower = LowerName::from(name);
                info!(
                    "deleting all records at name (not SOA or NS at origin): {:?}",
                    lower
                );

                let to_delete = records
                    .keys()
                    .filter(|key| key.name == lower)
                    .filter(|key| {
                        !(key.name == origin
                            && (key.record_type == RecordType::SOA
                                || key.record_type == RecordType::NS))
                    })
                    .cloned()
                    .collect::<Vec<RrKey>>();

                for delete in to_delete {
                    records.remove(&delete);
                    updated = true;
                }
            }
            // ANY      rrset    empty    Delete an RRset
            UpdateOp::DeleteRrset { name, rtype } => {
                let lower = LowerName::from(name);
                if lower == origin
                    && (*rtype == RecordType::SOA || *rtype == RecordType::NS)
                {
                    // SOA and NS records are not to be deleted if they are
                    // the origin records
                    info!("skipping delete of {:?} see RFC 2136 - 3.4.2.3", rtype);
                    continue;
                }

                let deleted = records.remove(&RrKey::new(lower, *rtype));
                info!("deleted rrset: {:?}", deleted.is_some());
                updated = updated || deleted.is_some();
            }
            // NONE     rrset    rr       Delete an RR from an RRset
            UpdateOp::Delete(record) => {
                if record.record_type() == RecordType::SOA {
                    continue;
                }

                let lower = LowerName::from(record.name());
                let key = RrKey::new(lower.clone(), record.record_type());

                if record.record_type() == RecordType::NS && lower == origin {
                    let last_ns = records
                        .get(&key)
                        .map(|rrset| rrset.records_without_rrsigs().count() <= 1)
                        .unwrap_or(false);
                    if last_ns {
                        continue;
                    }
                }

                if let Some(rrset) = records.get_mut(&key) {
                    let mut modified = RecordSet::clone(rrset);
                    let deleted = modified.remove(record, new_serial);
                    info!("deleted ({}) specific record: {:?}", deleted, record);

                    if deleted {
                        if modified.is_empty() {
                            records.remove(&key);
                        } else {
                            *rrset = Arc::new(modified);
                        }
                        updated = true;
                    }
                }
            }
        }
    }

    if !updated {
        return Ok(None);
    }

    // advance the SOA to the new serial, keeping the other fields as the
    // update left them
    let soa_key = RrKey::new(origin.clone(), RecordType::SOA);
    let (ttl, soa) = records
        .get(&soa_key)
        .and_then(|rrset| rrset.records_without_rrsigs().next())
        .and_then(|record| match record.data() {
            Some(RData::SOA(soa)) => Some((record.ttl(), soa.clone())),
            _ => None,
        })
        .ok_or(ResponseCode::ServFail)?;

    let new_soa = Record::from_rdata(
        origin_name.clone(),
        ttl,
        RData::SOA(SOA::new(
            soa.mname().clone(),
            soa.rname().clone(),
            new_serial,
            soa.refresh(),
            soa.retry(),
            soa.expire(),
            soa.minimum(),
        )),
    );
    let mut soa_rrset = RecordSet::new(&origin_name, RecordType::SOA, new_serial);
    soa_rrset.insert(new_soa, new_serial);
    records.insert(soa_key, Arc::new(soa_rrset));

    Ok(Some(ZoneContents::from_parts(origin, records)))
}

/// Processes a dynamic update end to end.
///
/// The request is expected to be TSIG-verified already. On success the new
/// serial is live: the changesets (the user's and, for signed zones, the
/// signer's, merged) are durable in the journal and the new content tree
/// answers queries. On any failure before the journal commit the zone is
/// untouched and the client gets the RCODE.
pub async fn process_update(
    ctx: &Arc<EventCtx>,
    zone: &Arc<Zone>,
    request: &UpdateRequest,
) -> UpdateResult<u32> {
    let config = zone.config();

    let msg = match &request.key_name {
        Some(key) => format!(
            "UPDATE of '{}' from {} (key {})",
            zone.name(),
            request.peer,
            key
        ),
        None => format!("UPDATE of '{}' from {}", zone.name(), request.peer),
    };
    info!("{msg} Started.");

    if !config.is_update_allowed(request.peer.ip()) {
        warn!("{msg} Refused, peer is not allowed to update.");
        return Err(ResponseCode::Refused);
    }

    // one writer at a time per zone
    let mut state = zone.state.lock().await;
    if state.discarded {
        return Err(ResponseCode::NotAuth);
    }

    let old_contents = zone.contents().ok_or(ResponseCode::NotAuth)?;

    verify_prerequisites(&old_contents, &request.prerequisites)?;
    pre_scan(&old_contents, &request.updates)?;

    let old_serial = old_contents.serial();
    let new_serial = next_serial(old_serial, config.serial_policy);
    if !(SerialNumber(old_serial) < SerialNumber(new_serial)) {
        warn!(
            "New serial will be lower than the current one. Old: {old_serial} new: {new_serial}."
        );
    }

    let new_contents = match apply_update_records(&old_contents, &request.updates, new_serial)? {
        Some(contents) => contents,
        None => {
            info!("{msg} No change to zone made.");
            return Ok(old_serial);
        }
    };

    let user_ch = content::diff_any(&old_contents, &new_contents).map_err(|e| {
        error!("{msg} {e}");
        ResponseCode::ServFail
    })?;

    // sign: a full resign when the update touched keys or NSEC3 parameters
    // at the apex, otherwise only the records changed by the update
    let mut sec_ch = Changeset::new();
    let mut refresh_at = 0;
    if config.dnssec_enable {
        let full_resign =
            content::apex_rrset_changed(&old_contents, &new_contents, RecordType::DNSKEY)
                || content::apex_rrset_changed(&old_contents, &new_contents, RecordType::NSEC3PARAM);

        debug!("{msg} Signing the UPDATE");
        let signed = if full_resign {
            ctx.signer
                .sign_zone(&new_contents, SoaSerialPolicy::Keep, new_serial, &mut sec_ch)
        } else {
            ctx.signer.sign_changeset(
                &new_contents,
                &user_ch,
                SoaSerialPolicy::Keep,
                new_serial,
                &mut sec_ch,
            )
        };
        refresh_at = signed.map_err(|e| {
            error!("{msg} Failed to sign incoming update ({e})");
            ResponseCode::ServFail
        })?;
    }

    let new_signatures = !sec_ch.is_empty();

    if user_ch.is_empty() && !new_signatures {
        info!("{msg} No change to zone made.");
        return Ok(old_serial);
    }

    // merge the user and signing changesets; the signing changeset's SOA is
    // authoritative for the merged result
    let merged = if new_signatures {
        let mut merged = user_ch;
        merged.merge(sec_ch.clone()).map_err(|e| {
            error!("{msg} Failed to merge changesets ({e})");
            ResponseCode::ServFail
        })?;
        merged
    } else {
        user_ch
    };

    // persist; a full journal is flushed and retried once inside
    let batch = ChangesetBatch::from(merged);
    let final_contents = {
        let journal_guard = zone.journal().await;
        let tx = match journal_guard.as_ref() {
            Some(journal) => Some(
                zone.store_changesets_locked(&mut state, journal, &batch)
                    .await
                    .map_err(|e| {
                        error!("{msg} Failed to store changesets ({e})");
                        ResponseCode::ServFail
                    })?,
            ),
            None => None,
        };

        // apply the signing changeset on top of the updated contents
        let final_contents = if new_signatures {
            match new_contents.with_changeset(&sec_ch) {
                Ok(signed) => Arc::new(signed),
                Err(e) => {
                    error!("{msg} Failed to sign incoming update ({e})");
                    if let Some(tx) = tx {
                        let _ = tx.rollback();
                    }
                    return Err(ResponseCode::ServFail);
                }
            }
        } else {
            Arc::new(new_contents)
        };

        // the journal entry is durable before the new version answers queries
        if let Some(tx) = tx {
            if let Err(e) = tx.commit() {
                error!("{msg} Failed to commit stored changesets: {e}.");
                return Err(ResponseCode::ServFail);
            }
        }

        final_contents
    };

    // switch zone contents
    zone.publish(Some(final_contents));

    if new_signatures {
        events::replan_dnssec_after_update(ctx, zone, &mut state, refresh_at);
        info!("{msg} Signed.");
    }
    info!("{msg} Finished.");

    // sync the zonefile immediately if configured
    if config.dbsync_timeout == 0 {
        drop(state);
        events::schedule_flush(ctx, zone, Duration::ZERO).await;
    }

    Ok(new_serial)
}

/// Installs freshly loaded contents, e.g. after a zonefile reload.
///
/// When the zone builds diffs and both versions are present, the difference
/// is recorded in the journal so secondaries can fetch it incrementally; a
/// reload whose serial did not move is installed with a warning and no
/// changeset. DNSSEC-enabled zones are re-signed over the new contents and
/// the resign timer is re-armed at the signer's refresh time.
pub async fn reload_zone(
    ctx: &Arc<EventCtx>,
    zone: &Arc<Zone>,
    new_contents: ZoneContents,
) -> ZoneResult<()> {
    let mut state = zone.state.lock().await;
    if state.discarded {
        return Err(ZoneErrorKind::InvalidArgument("zone was discarded").into());
    }

    let old_contents = zone.contents();

    // difference between the running version and the freshly loaded one
    let mut diff_ch = None;
    if zone.config().build_diffs {
        if let Some(old) = old_contents.as_deref() {
            match content::diff(old, &new_contents) {
                Ok(changeset) => diff_ch = Some(changeset),
                Err(e) => match e.kind() {
                    ZoneErrorKind::NoDiff | ZoneErrorKind::SerialRegression { .. } => {
                        warn!(
                            "Zone file for '{}' changed, but serial didn't move forward - won't create changesets.",
                            zone.name()
                        );
                    }
                    _ => {
                        warn!(
                            "Failed to calculate differences from the zone file update: {e}"
                        );
                        return Err(e);
                    }
                },
            }
        }
    }

    // re-sign the new version if enabled; the signer advances the serial
    // once more so the change is always flushable
    let mut sec_ch = Changeset::new();
    let mut refresh_at = 0;
    if zone.config().dnssec_enable {
        let msg = format!("DNSSEC: Zone {} -", zone.name());
        info!("{msg} Signing started...");

        let old_serial = new_contents.serial();
        let new_serial = next_serial(old_serial, zone.config().serial_policy);
        if !(SerialNumber(old_serial) < SerialNumber(new_serial)) {
            warn!(
                "New serial will be lower than the current one. Old: {old_serial} new: {new_serial}."
            );
        }

        refresh_at =
            ctx.signer
                .sign_zone(&new_contents, SoaSerialPolicy::Update, new_serial, &mut sec_ch)?;
    }

    // merge the diff and signing changesets and persist them together
    let merged = match (diff_ch, sec_ch.is_empty()) {
        (Some(mut diff), false) => {
            diff.merge(sec_ch.clone())?;
            Some(diff)
        }
        (Some(diff), true) => Some(diff),
        (None, false) => Some(sec_ch.clone()),
        (None, true) => None,
    };

    let final_contents = if sec_ch.is_empty() {
        new_contents
    } else {
        new_contents.with_changeset(&sec_ch)?
    };

    if let Some(merged) = merged {
        let batch = ChangesetBatch::from(merged);
        let journal_guard = zone.journal().await;
        if let Some(journal) = journal_guard.as_ref() {
            let tx = zone
                .store_changesets_locked(&mut state, journal, &batch)
                .await?;
            tx.commit()?;
        }
    }

    zone.publish(Some(Arc::new(final_contents)));

    if zone.config().dnssec_enable && refresh_at != 0 {
        state.timers.cancel_dnssec();
        events::replan_dnssec_after_update(ctx, zone, &mut state, refresh_at);
        info!("DNSSEC: Zone {} - Successfully signed.", zone.name());
    }

    Ok(())
}

/// Signs the zone outside the update path: at startup, on the resign timer,
/// or forced from an operator action.
///
/// The signing changeset advances the serial itself, and is stored, applied,
/// and published like any other change. Returns the wall-clock second the
/// signer wants the next pass at.
pub async fn sign_zone_now(ctx: &Arc<EventCtx>, zone: &Arc<Zone>, force: bool) -> ZoneResult<u64> {
    let msg = format!("DNSSEC: Zone {} -", zone.name());

    let mut state = zone.state.lock().await;
    if state.discarded {
        return Ok(0);
    }

    let contents = zone.contents().ok_or(ZoneErrorKind::NotAuthoritative)?;

    if force {
        info!("{msg} Complete resign started (dropping all previous signatures)...");
    } else {
        info!("{msg} Signing zone...");
    }

    let old_serial = contents.serial();
    let new_serial = next_serial(old_serial, zone.config().serial_policy);
    if !(SerialNumber(old_serial) < SerialNumber(new_serial)) {
        warn!(
            "New serial will be lower than the current one. Old: {old_serial} new: {new_serial}."
        );
    }

    let mut sec_ch = Changeset::new();
    let refresh_at =
        ctx.signer
            .sign_zone(&contents, SoaSerialPolicy::Update, new_serial, &mut sec_ch)?;

    if !sec_ch.is_empty() {
        let batch = ChangesetBatch::from(sec_ch.clone());
        let journal_guard = zone.journal().await;
        let tx = match journal_guard.as_ref() {
            Some(journal) => Some(
                zone.store_changesets_locked(&mut state, journal, &batch)
                    .await?,
            ),
            None => None,
        };

        let new_contents = match contents.with_changeset(&sec_ch) {
            Ok(signed) => Arc::new(signed),
            Err(e) => {
                error!("{msg} Could not sign zone ({e}).");
                if let Some(tx) = tx {
                    let _ = tx.rollback();
                }
                return Err(e);
            }
        };

        if let Some(tx) = tx {
            if let Err(e) = tx.commit() {
                error!("{msg} Failed to commit stored changesets: {e}.");
                return Err(e.into());
            }
        }

        zone.publish(Some(new_contents));
        info!("{msg} Successfully signed.");
    }

    Ok(refresh_at)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use crate::proto::rr::rdata::NS;

    use super::*;

    fn soa_record(serial: u32) -> Record {
        let origin = Name::from_str("example.com.").unwrap();
        Record::from_rdata(
            origin,
            3600,
            RData::SOA(SOA::new(
                Name::from_str("ns1.example.com.").unwrap(),
                Name::from_str("admin.example.com.").unwrap(),
                serial,
                7200,
                1800,
                1_209_600,
                300,
            )),
        )
    }

    fn ns_record(target: &str) -> Record {
        Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            3600,
            RData::NS(NS(Name::from_str(target).unwrap())),
        )
    }

    fn a_record(host: &str, addr: Ipv4Addr) -> Record {
        Record::from_rdata(Name::from_str(host).unwrap(), 300, RData::A(addr.into()))
    }

    fn rrset_of(record: Record) -> RecordSet {
        let name = record.name().clone();
        let mut rrset = RecordSet::new(&name, record.record_type(), 0);
        rrset.insert(record, 0);
        rrset
    }

    fn contents(serial: u32) -> ZoneContents {
        let origin = Name::from_str("example.com.").unwrap();
        let lower = LowerName::from(&origin);
        let mut records = BTreeMap::new();

        records.insert(
            RrKey::new(lower.clone(), RecordType::SOA),
            rrset_of(soa_record(serial)),
        );
        records.insert(
            RrKey::new(lower, RecordType::NS),
            rrset_of(ns_record("ns1.example.com.")),
        );

        let www = a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1));
        records.insert(
            RrKey::new(LowerName::from(www.name()), RecordType::A),
            rrset_of(www),
        );

        ZoneContents::new(origin, records).unwrap()
    }

    #[test]
    fn test_verify_prerequisites() {
        let contents = contents(100);

        // name in use
        verify_prerequisites(
            &contents,
            &[Prerequisite::NameInUse(
                Name::from_str("www.example.com.").unwrap(),
            )],
        )
        .unwrap();
        assert_eq!(
            verify_prerequisites(
                &contents,
                &[Prerequisite::NameInUse(
                    Name::from_str("missing.example.com.").unwrap()
                )],
            ),
            Err(ResponseCode::NXDomain)
        );

        // name not in use
        assert_eq!(
            verify_prerequisites(
                &contents,
                &[Prerequisite::NameNotInUse(
                    Name::from_str("www.example.com.").unwrap()
                )],
            ),
            Err(ResponseCode::YXDomain)
        );

        // rrset exists / not exists
        verify_prerequisites(
            &contents,
            &[Prerequisite::RrsetExists {
                name: Name::from_str("www.example.com.").unwrap(),
                rtype: RecordType::A,
            }],
        )
        .unwrap();
        assert_eq!(
            verify_prerequisites(
                &contents,
                &[Prerequisite::RrsetNotExists {
                    name: Name::from_str("www.example.com.").unwrap(),
                    rtype: RecordType::A,
                }],
            ),
            Err(ResponseCode::YXRRSet)
        );

        // value dependent comparison ignores the prerequisite's zero ttl
        let mut required = rrset_of(a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1)));
        verify_prerequisites(&contents, &[Prerequisite::RrsetEquals(required.clone())]).unwrap();

        required.insert(
            a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 2)),
            0,
        );
        assert_eq!(
            verify_prerequisites(&contents, &[Prerequisite::RrsetEquals(required)]),
            Err(ResponseCode::NXRRSet)
        );

        // out of zone
        assert_eq!(
            verify_prerequisites(
                &contents,
                &[Prerequisite::NameInUse(
                    Name::from_str("www.example.net.").unwrap()
                )],
            ),
            Err(ResponseCode::NotZone)
        );
    }

    #[test]
    fn test_pre_scan() {
        let contents = contents(100);

        pre_scan(
            &contents,
            &[UpdateOp::Add(a_record(
                "mail.example.com.",
                Ipv4Addr::new(192, 0, 2, 25),
            ))],
        )
        .unwrap();

        assert_eq!(
            pre_scan(
                &contents,
                &[UpdateOp::Add(a_record(
                    "www.example.net.",
                    Ipv4Addr::new(192, 0, 2, 1)
                ))],
            ),
            Err(ResponseCode::NotZone)
        );

        assert_eq!(
            pre_scan(
                &contents,
                &[UpdateOp::DeleteRrset {
                    name: Name::from_str("www.example.com.").unwrap(),
                    rtype: RecordType::AXFR,
                }],
            ),
            Err(ResponseCode::FormErr)
        );
    }

    #[test]
    fn test_apply_add_and_serial_bump() {
        let old = contents(100);

        let new = apply_update_records(
            &old,
            &[UpdateOp::Add(a_record(
                "mail.example.com.",
                Ipv4Addr::new(192, 0, 2, 25),
            ))],
            101,
        )
        .unwrap()
        .expect("update should change the zone");

        assert_eq!(new.serial(), 101);
        assert!(new
            .lookup(
                &LowerName::from_str("mail.example.com.").unwrap(),
                RecordType::A
            )
            .is_some());
    }

    #[test]
    fn test_apply_no_change() {
        let old = contents(100);

        // deleting a record that isn't there changes nothing
        let result = apply_update_records(
            &old,
            &[UpdateOp::Delete(a_record(
                "missing.example.com.",
                Ipv4Addr::new(192, 0, 2, 9),
            ))],
            101,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_apply_origin_protection() {
        let old = contents(100);

        // SOA and NS at the apex survive a delete-name
        let new = apply_update_records(
            &old,
            &[
                UpdateOp::Add(a_record("example.com.", Ipv4Addr::new(192, 0, 2, 7))),
                UpdateOp::DeleteName(Name::from_str("example.com.").unwrap()),
            ],
            101,
        )
        .unwrap()
        .expect("the apex A record should have been added and deleted");

        let origin = LowerName::from_str("example.com.").unwrap();
        assert!(new.lookup(&origin, RecordType::SOA).is_some());
        assert!(new.lookup(&origin, RecordType::NS).is_some());
        assert!(new.lookup(&origin, RecordType::A).is_none());

        // a delete-rrset of the apex NS is skipped entirely
        let result = apply_update_records(
            &old,
            &[UpdateOp::DeleteRrset {
                name: Name::from_str("example.com.").unwrap(),
                rtype: RecordType::NS,
            }],
            101,
        )
        .unwrap();
        assert!(result.is_none());

        // the last NS record at the apex survives a specific delete
        let result = apply_update_records(
            &old,
            &[UpdateOp::Delete(ns_record("ns1.example.com."))],
            101,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_apply_delete_rrset() {
        let old = contents(100);

        let new = apply_update_records(
            &old,
            &[UpdateOp::DeleteRrset {
                name: Name::from_str("www.example.com.").unwrap(),
                rtype: RecordType::A,
            }],
            101,
        )
        .unwrap()
        .expect("update should change the zone");

        assert!(new
            .lookup(
                &LowerName::from_str("www.example.com.").unwrap(),
                RecordType::A
            )
            .is_none());
        assert_eq!(new.serial(), 101);
    }
}
