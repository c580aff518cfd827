// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The zone handle: stable identity, live contents, journal, and timers

use std::ops::Deref;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use futures_util::lock::Mutex;
use tracing::{debug, error, info};

use crate::changeset::ChangesetBatch;
use crate::config::ZoneConfig;
use crate::content::ZoneContents;
use crate::error::{PersistenceResult, ZoneErrorKind, ZoneResult};
use crate::events::TimerHandle;
use crate::journal::{Journal, Transaction};
use crate::proto::rr::{LowerName, Name};
use crate::xfer::TransferState;
use crate::zonefile::write_zonefile;

/// Result of a journal-to-zonefile synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The zonefile was rewritten at this serial
    Synced(u32),
    /// The zonefile already carries the live serial, nothing was written
    UpToDate,
}

/// The timers a zone may have armed
#[derive(Default)]
pub(crate) struct ZoneTimers {
    pub(crate) refresh: Option<TimerHandle>,
    pub(crate) expire: Option<TimerHandle>,
    pub(crate) flush: Option<TimerHandle>,
    pub(crate) dnssec: Option<TimerHandle>,
    /// Wall-clock second the armed resign fires at
    pub(crate) dnssec_refresh_at: Option<u64>,
}

impl ZoneTimers {
    pub(crate) fn cancel_refresh(&mut self) {
        if let Some(timer) = self.refresh.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_expire(&mut self) {
        if let Some(timer) = self.expire.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_flush(&mut self) {
        if let Some(timer) = self.flush.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_dnssec(&mut self) {
        if let Some(timer) = self.dnssec.take() {
            timer.cancel();
        }
        self.dnssec_refresh_at = None;
    }

    fn cancel_all(&mut self) {
        self.cancel_refresh();
        self.cancel_expire();
        self.cancel_flush();
        self.cancel_dnssec();
    }
}

/// The mutable state of a zone, guarded by the per-zone lock.
///
/// The lock serializes writers (updates, transfers, flushes) and the state
/// machine transitions; the answering path never takes it.
#[derive(Default)]
pub struct ZoneState {
    pub(crate) xfr: TransferState,
    pub(crate) zonefile_serial: u32,
    pub(crate) zonefile_mtime: Option<SystemTime>,
    pub(crate) discarded: bool,
    pub(crate) timers: ZoneTimers,
}

/// A named zone hosted by this server.
///
/// The handle is the stable identity: it outlives any particular content
/// tree. Live contents hang off an atomically swappable pointer so readers
/// capture a version without locking; everything else (transfer state,
/// zonefile bookkeeping, timers) sits behind the per-zone lock.
pub struct Zone {
    name: LowerName,
    config: ZoneConfig,
    contents: ArcSwapOption<ZoneContents>,
    journal: Mutex<Option<Journal>>,
    pub(crate) state: tokio::sync::Mutex<ZoneState>,
}

impl Zone {
    /// Creates a zone handle with no contents (a stub awaiting its first
    /// transfer or load)
    pub fn new(name: Name, config: ZoneConfig) -> Self {
        Self {
            name: LowerName::from(name),
            config,
            contents: ArcSwapOption::from(None),
            journal: Mutex::new(None),
            state: tokio::sync::Mutex::new(ZoneState::default()),
        }
    }

    /// The zone's apex name
    pub fn name(&self) -> &LowerName {
        &self.name
    }

    /// The configuration snapshot this zone runs with
    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    /// Captures the live contents. Callers hold the returned tree for the
    /// duration of their read; swaps do not affect it.
    pub fn contents(&self) -> Option<Arc<ZoneContents>> {
        self.contents.load_full()
    }

    /// Publishes a new content tree (or unpublishes with `None`). The
    /// superseded tree is freed once the last reader drops its capture.
    pub fn publish(&self, contents: Option<Arc<ZoneContents>>) {
        self.contents.store(contents);
    }

    /// Atomically removes the contents, leaving the handle a stub. Returns
    /// the unpublished tree.
    pub fn take_contents(&self) -> Option<Arc<ZoneContents>> {
        self.contents.swap(None)
    }

    /// Serial of the live contents; `0` for a stub
    pub fn serial(&self) -> u32 {
        self.contents().map(|contents| contents.serial()).unwrap_or(0)
    }

    /// Associate a backing Journal with this zone
    pub async fn set_journal(&self, journal: Journal) {
        *self.journal.lock().await = Some(journal);
    }

    /// Opens the configured journal file and attaches it, capped at the
    /// configured size. Zones without a journal path keep none.
    pub async fn open_journal(&self) -> ZoneResult<bool> {
        let path = match &self.config.journal_file_path {
            Some(path) => path,
            None => return Ok(false),
        };

        let mut journal = Journal::from_file(path)?;
        journal.set_max_bytes(self.config.journal_max_bytes);
        self.set_journal(journal).await;
        Ok(true)
    }

    /// Returns the associated Journal
    pub async fn journal(&self) -> impl Deref<Target = Option<Journal>> + '_ {
        self.journal.lock().await
    }

    /// True when a journal is attached
    pub async fn has_journal(&self) -> bool {
        self.journal.lock().await.is_some()
    }

    /// Current inbound transfer state
    pub async fn transfer_state(&self) -> TransferState {
        self.state.lock().await.xfr
    }

    /// Serial last persisted to the on-disk zonefile
    pub async fn zonefile_serial(&self) -> u32 {
        self.state.lock().await.zonefile_serial
    }

    /// Records the serial the on-disk zonefile carries, used when the zone
    /// was just loaded from disk
    pub async fn set_zonefile_serial(&self, serial: u32) {
        self.state.lock().await.zonefile_serial = serial;
    }

    /// True when the EXPIRE timer is armed
    pub async fn expire_armed(&self) -> bool {
        self.state.lock().await.timers.expire.is_some()
    }

    /// Wall-clock second the next resign is planned at, if one is armed
    pub async fn dnssec_scheduled_at(&self) -> Option<u64> {
        self.state.lock().await.timers.dnssec_refresh_at
    }

    /// True when the zone was discarded during reconfiguration; timer
    /// callbacks observing this return without work
    pub async fn is_discarded(&self) -> bool {
        self.state.lock().await.discarded
    }

    /// Marks the zone discarded and cancels every armed timer. Idempotent.
    pub async fn discard(&self) {
        let mut state = self.state.lock().await;
        state.discarded = true;
        state.timers.cancel_all();
    }

    /// Synchronizes the journal's unsynced history into the text zonefile.
    ///
    /// When the live serial already matches the zonefile nothing is written.
    /// Otherwise the zone is dumped atomically, every committed journal entry
    /// has its dirty flag cleared, and the zonefile serial advances to the
    /// live serial.
    pub async fn flush_to_zonefile(&self) -> ZoneResult<FlushOutcome> {
        let mut state = self.state.lock().await;
        let journal = self.journal.lock().await;
        self.flush_locked(&mut state, journal.as_ref())
    }

    /// The flush path for callers that already hold the zone lock
    pub(crate) fn flush_locked(
        &self,
        state: &mut ZoneState,
        journal: Option<&Journal>,
    ) -> ZoneResult<FlushOutcome> {
        let contents = self
            .contents()
            .ok_or(ZoneErrorKind::InvalidArgument("zone has no contents"))?;
        let serial_to = contents.serial();

        if state.zonefile_serial == serial_to {
            debug!("'{}' zonefile is in sync with differences", self.name);
            return Ok(FlushOutcome::UpToDate);
        }

        debug!(
            "syncing '{}' differences to '{}' (SOA serial {})",
            self.name,
            self.config.zone_file_path.display(),
            serial_to
        );

        let mtime = write_zonefile(&contents, &self.config.zone_file_path)?;
        state.zonefile_mtime = Some(mtime);

        // unmark all dirty entries in the journal
        if let Some(journal) = journal {
            journal.walk(|entry| {
                if entry.is_valid() && entry.is_dirty() {
                    entry.clear_dirty();
                }
            })?;
        }

        debug!("new '{}' zonefile serial is {}", self.name, serial_to);
        state.zonefile_serial = serial_to;

        Ok(FlushOutcome::Synced(serial_to))
    }

    /// Stores a batch of changesets in the journal, within a single
    /// transaction, recovering once from a full journal by flushing the
    /// zonefile and retrying.
    ///
    /// The returned transaction is left open: the caller commits after the
    /// new contents are ready to publish, or rolls back on any failure.
    pub(crate) async fn store_changesets_locked<'j>(
        &self,
        state: &mut ZoneState,
        journal: &'j Journal,
        batch: &ChangesetBatch,
    ) -> ZoneResult<Transaction<'j>> {
        if batch.is_empty() {
            return Err(ZoneErrorKind::InvalidArgument("no changesets to store").into());
        }

        match try_store(journal, batch) {
            Err(e) if e.is_full() => {
                info!("Journal for '{}' is full, flushing.", self.name);

                // the flush clears dirty flags so the journal can evict; a
                // failed flush aborts the whole operation
                if let Err(flush_err) = self.flush_locked(state, Some(journal)) {
                    error!("Failed to sync journal to zone file.");
                    return Err(flush_err);
                }

                try_store(journal, batch).map_err(Into::into)
            }
            other => other.map_err(Into::into),
        }
    }

    /// Replays the journal on top of freshly loaded contents.
    ///
    /// Walks the chain of changesets starting at the live (zonefile) serial
    /// and applies as much contiguous history as the journal holds; an
    /// incomplete history is acceptable, the zone is simply behind and the
    /// next refresh catches it up. Returns the serial reached, if any
    /// catch-up happened.
    pub async fn journal_apply(&self) -> ZoneResult<Option<u32>> {
        let _state = self.state.lock().await;

        let contents = self
            .contents()
            .ok_or(ZoneErrorKind::InvalidArgument("zone has no contents"))?;
        let serial = contents.serial();

        let journal_guard = self.journal.lock().await;
        let journal = match journal_guard.as_ref() {
            Some(journal) => journal,
            None => return Ok(None),
        };

        if !journal.is_used()? {
            return Ok(None);
        }

        let batch = match journal.load_changesets(serial, serial.wrapping_sub(1)) {
            Ok(batch) => batch,
            // nothing starting at our serial: the zone is simply current
            Err(e) if e.is_range() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if batch.len() == 0 {
            return Ok(None);
        }

        info!(
            "Applying {} changesets from journal to zone '{}'.",
            batch.len(),
            self.name
        );

        let mut current = ZoneContents::clone(&contents);
        for changeset in batch.iter() {
            current = current.with_changeset(changeset)?;
        }

        let new_serial = current.serial();
        info!("Zone '{}' serial {} -> {}.", self.name, serial, new_serial);

        self.publish(Some(Arc::new(current)));
        Ok(Some(new_serial))
    }
}

fn try_store<'j>(
    journal: &'j Journal,
    batch: &ChangesetBatch,
) -> PersistenceResult<Transaction<'j>> {
    let tx = journal.begin_trans()?;

    for changeset in batch.iter() {
        // a failed store drops the transaction, rolling it back
        journal.store_changeset(changeset)?;
    }

    Ok(tx)
}
