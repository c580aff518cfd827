// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The changeset journal, an append-mostly audit log of all changes to a zone

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use crate::changeset::{Changeset, ChangesetBatch};
use crate::error::{PersistenceErrorKind, PersistenceResult};
use crate::serial::JournalKey;

/// The current Journal version of the application
pub const CURRENT_VERSION: i64 = 1;

/// Default upper bound on the journal size in bytes
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

const FLAG_VALID: u32 = 0x01;
const FLAG_DIRTY: u32 = 0x02;
const FLAG_TRANS: u32 = 0x04;

/// The Journal is the persistent log of changesets applied to a zone.
///
/// Entries are keyed by the packed (from, to) serial pair of the changeset
/// they store, flagged with their lifecycle state, and replayed on restart to
/// catch the zone up from the last zonefile synchronization. The log is
/// bounded: when an entry does not fit, clean entries (already synced to the
/// zonefile) are evicted oldest-first, and the store fails with a full
/// condition once only dirty entries remain.
#[derive(Debug)]
pub struct Journal {
    conn: Mutex<Connection>,
    version: i64,
    max_bytes: usize,
    trans_open: AtomicBool,
}

impl Journal {
    /// Constructs a new Journal, attaching to the specified Sqlite Connection
    pub fn new(conn: Connection) -> PersistenceResult<Self> {
        let version = Self::select_schema_version(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            version,
            max_bytes: DEFAULT_MAX_BYTES,
            trans_open: AtomicBool::new(false),
        })
    }

    /// Constructs a new Journal opening a Sqlite connection to the file at the
    /// specified path
    pub fn from_file(journal_file: &Path) -> PersistenceResult<Self> {
        let mut journal = Self::new(Connection::open(journal_file)?)?;
        journal.schema_up()?;
        Ok(journal)
    }

    /// Constructs an in-memory Journal, for tests and ephemeral zones
    pub fn in_memory() -> PersistenceResult<Self> {
        let mut journal = Self::new(Connection::open_in_memory()?)?;
        journal.schema_up()?;
        Ok(journal)
    }

    /// Returns a reference to the Sqlite Connection
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("conn poisoned")
    }

    /// Returns the current schema version of the journal
    pub fn schema_version(&self) -> i64 {
        self.version
    }

    /// Caps the journal at `max_bytes` of stored changeset payload
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Returns true if the journal holds any committed entries
    pub fn is_used(&self) -> PersistenceResult<bool> {
        let used: i64 = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM changesets
                 WHERE (flags & $1) != 0 AND (flags & $2) = 0)",
            params![i64::from(FLAG_VALID), i64::from(FLAG_TRANS)],
            |row| row.get(0),
        )?;

        Ok(used != 0)
    }

    /// Begins a journal transaction.
    ///
    /// Only one transaction may be open per journal; a concurrent attempt
    /// fails with a busy condition. Entries stored while the transaction is
    /// open stay invisible to readers until commit.
    pub fn begin_trans(&self) -> PersistenceResult<Transaction<'_>> {
        if self
            .trans_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PersistenceErrorKind::TransactionBusy.into());
        }

        if let Err(e) = self.conn().execute_batch("BEGIN IMMEDIATE") {
            self.trans_open.store(false, Ordering::Release);
            return Err(e.into());
        }

        Ok(Transaction {
            journal: self,
            finished: false,
        })
    }

    fn commit_trans(&self) -> PersistenceResult<()> {
        let result = self
            .conn()
            .execute_batch(&format!(
                "UPDATE changesets SET flags = flags & ~{trans} WHERE (flags & {trans}) != 0;
                 COMMIT;",
                trans = FLAG_TRANS
            ))
            .map_err(Into::into);
        self.trans_open.store(false, Ordering::Release);
        result
    }

    fn rollback_trans(&self) -> PersistenceResult<()> {
        let result = self
            .conn()
            .execute_batch("ROLLBACK")
            .map_err(Into::into);
        self.trans_open.store(false, Ordering::Release);
        result
    }

    /// Reserves `size` bytes in the journal under `key`.
    ///
    /// Clean entries are evicted oldest-first to make room. Fails with a full
    /// condition when the entry cannot fit even with every clean entry gone;
    /// the caller is expected to flush the zonefile (clearing dirty flags) and
    /// retry once.
    pub fn map(&self, key: JournalKey, size: usize) -> PersistenceResult<JournalRegion> {
        if size > self.max_bytes {
            return Err(PersistenceErrorKind::Full.into());
        }

        let conn = self.conn();
        let mut used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM changesets",
            [],
            |row| row.get(0),
        )?;

        while used as usize + size > self.max_bytes {
            let evictable: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT _rowid_, LENGTH(payload) FROM changesets
                      WHERE (flags & $1) != 0
                        AND (flags & $2) = 0
                        AND (flags & $3) = 0
                      ORDER BY _rowid_ LIMIT 1",
                    params![
                        i64::from(FLAG_VALID),
                        i64::from(FLAG_DIRTY),
                        i64::from(FLAG_TRANS)
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match evictable {
                Some((rowid, len)) => {
                    debug!("evicting clean journal entry at row {rowid}");
                    conn.execute("DELETE FROM changesets WHERE _rowid_ = $1", [rowid])?;
                    used -= len;
                }
                None => return Err(PersistenceErrorKind::Full.into()),
            }
        }

        Ok(JournalRegion {
            key,
            buf: vec![0; size],
        })
    }

    /// Finalizes a mapped region, inserting the entry into the log.
    ///
    /// The entry becomes VALID when `validate` is set; it is always born
    /// DIRTY (not yet reflected in the zonefile), and carries the transaction
    /// flag while the journal transaction is open.
    pub fn unmap(&self, region: JournalRegion, validate: bool) -> PersistenceResult<()> {
        let JournalRegion { key, buf } = region;

        let mut flags = FLAG_DIRTY;
        if validate {
            flags |= FLAG_VALID;
        }
        if self.trans_open.load(Ordering::Acquire) {
            flags |= FLAG_TRANS;
        }

        let count = self.conn().execute(
            "INSERT INTO changesets (key, serial_from, serial_to, flags, payload)
             VALUES ($1, $2, $3, $4, $5)",
            params![
                key.as_u64() as i64,
                i64::from(key.serial_from()),
                i64::from(key.serial_to()),
                i64::from(flags),
                buf,
            ],
        )?;

        if count != 1 {
            return Err(PersistenceErrorKind::WrongInsertCount {
                got: count,
                expect: 1,
            }
            .into());
        }

        Ok(())
    }

    /// Serializes and stores a single changeset under its serial-pair key
    pub fn store_changeset(&self, changeset: &Changeset) -> PersistenceResult<()> {
        let serial_from = changeset
            .serial_from()
            .ok_or(PersistenceErrorKind::Malformed("changeset has no starting SOA"))?;
        let serial_to = changeset
            .serial_to()
            .ok_or(PersistenceErrorKind::Malformed("changeset has no resulting SOA"))?;

        debug!("saving changeset from {serial_from} to {serial_to}");

        let key = JournalKey::pack(serial_from, serial_to);
        let bytes = changeset.to_bytes()?;

        let mut region = self.map(key, bytes.len())?;
        let write_result = region.write(&bytes);
        // finalize the region either way; only a successful write validates
        self.unmap(region, write_result.is_ok())?;
        write_result
    }

    /// Loads the contiguous chain of changesets starting at serial `from`.
    ///
    /// The walk ends at serial `to`, at the end of the log, or at the first
    /// break in the chain, whichever comes first; callers detect a partial
    /// history by comparing the batch's final serial against `to`. Fails with
    /// a range condition when the journal holds nothing starting at `from`.
    pub fn load_changesets(&self, from: u32, to: u32) -> PersistenceResult<ChangesetBatch> {
        if !self.is_used()? {
            return Err(PersistenceErrorKind::Range.into());
        }

        let mut found_to = from;
        let mut batch = ChangesetBatch::new();

        for entry in self.fetch_from(from)? {
            if found_to == to {
                break;
            }

            // skip wrong changesets
            if !entry.is_valid() || entry.in_transaction() {
                continue;
            }

            // the history is contiguous only while each entry picks up
            // exactly where the previous one ended
            if entry.key().serial_from() != found_to {
                break;
            }

            let changeset = Changeset::from_bytes(entry.payload())?;
            if changeset.serial_from() != Some(entry.key().serial_from())
                || changeset.serial_to() != Some(entry.key().serial_to())
            {
                return Err(PersistenceErrorKind::Malformed(
                    "journal key does not match changeset serials",
                )
                .into());
            }

            found_to = entry.key().serial_to();
            batch.push(changeset).map_err(|_| {
                PersistenceErrorKind::Malformed("journal produced a discontinuous batch")
            })?;
        }

        Ok(batch)
    }

    /// Returns an iterator over every entry, to be used to replay a journal
    pub fn iter(&self) -> JournalIter<'_> {
        JournalIter {
            journal: self,
            current_row_id: 0,
        }
    }

    /// Returns an iterator positioned at the first committed entry whose
    /// changeset starts at `serial`
    pub fn fetch_from(&self, serial: u32) -> PersistenceResult<JournalIter<'_>> {
        self.fetch_where("serial_from", serial)
    }

    /// Returns an iterator positioned at the first committed entry whose
    /// changeset ends at `serial`
    pub fn fetch_to(&self, serial: u32) -> PersistenceResult<JournalIter<'_>> {
        self.fetch_where("serial_to", serial)
    }

    fn fetch_where(&self, column: &str, serial: u32) -> PersistenceResult<JournalIter<'_>> {
        let row_id: Option<i64> = self
            .conn()
            .query_row(
                &format!(
                    "SELECT _rowid_ FROM changesets
                      WHERE {column} = $1 AND (flags & $2) != 0 AND (flags & $3) = 0
                      ORDER BY _rowid_ LIMIT 1"
                ),
                params![
                    i64::from(serial),
                    i64::from(FLAG_VALID),
                    i64::from(FLAG_TRANS)
                ],
                |row| row.get(0),
            )
            .optional()?;

        match row_id {
            Some(row_id) => Ok(JournalIter {
                journal: self,
                current_row_id: row_id - 1,
            }),
            None => Err(PersistenceErrorKind::Range.into()),
        }
    }

    /// Applies the visitor to every entry in the journal. Flag changes made
    /// by the visitor, e.g. clearing the dirty flag after a zonefile sync,
    /// are written back.
    pub fn walk<F>(&self, mut visitor: F) -> PersistenceResult<()>
    where
        F: FnMut(&mut JournalEntryMeta),
    {
        let rows: Vec<(i64, i64, i64)> = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT _rowid_, key, flags FROM changesets ORDER BY _rowid_")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<_, _>>()?;
            rows
        };

        for (row_id, key, flags) in rows {
            let mut meta = JournalEntryMeta {
                key: JournalKey::from(key as u64),
                flags: flags as u32,
            };
            let before = meta.flags;
            visitor(&mut meta);

            if meta.flags != before {
                self.conn().execute(
                    "UPDATE changesets SET flags = $1 WHERE _rowid_ = $2",
                    params![i64::from(meta.flags), row_id],
                )?;
            }
        }

        Ok(())
    }

    fn select_entry(&self, row_id: i64) -> PersistenceResult<Option<JournalEntry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT _rowid_, key, flags, payload FROM changesets
                  WHERE _rowid_ >= $1 ORDER BY _rowid_ LIMIT 1",
                [row_id],
                |row| {
                    Ok(JournalEntry {
                        row_id: row.get(0)?,
                        key: JournalKey::from(row.get::<_, i64>(1)? as u64),
                        flags: row.get::<_, i64>(2)? as u32,
                        payload: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(entry)
    }

    /// selects the current schema version of the journal DB, returns -1 if
    /// there is no schema
    fn select_schema_version(conn: &Connection) -> PersistenceResult<i64> {
        // first see if our schema is there
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='jrnl_schema'",
        )?;

        let schema_opt: Option<Result<String, _>> = stmt.query_map([], |row| row.get(0))?.next();

        let schema = match schema_opt {
            Some(Ok(string)) => string,
            Some(Err(err)) => return Err(err.into()),
            None => return Ok(-1),
        };

        assert_eq!(&schema, "jrnl_schema");

        let version: i64 = conn.query_row("SELECT version FROM jrnl_schema", [], |row| row.get(0))?;

        Ok(version)
    }

    /// update the schema version
    fn update_schema_version(&self, new_version: i64) -> PersistenceResult<()> {
        // validate the versions of all the schemas...
        assert!(new_version <= CURRENT_VERSION);

        let count = self
            .conn()
            .execute("UPDATE jrnl_schema SET version = $1", [&new_version])?;

        assert_eq!(count, 1);
        Ok(())
    }

    /// initializes the schema for the Journal
    pub fn schema_up(&mut self) -> PersistenceResult<i64> {
        while self.version < CURRENT_VERSION {
            match self.version + 1 {
                0 => self.version = self.init_up()?,
                1 => self.version = self.changesets_up()?,
                _ => panic!("incorrect version somewhere"), // valid panic, non-recoverable state
            }

            self.update_schema_version(self.version)?;
        }

        Ok(self.version)
    }

    /// initial schema, include the jrnl_schema table for tracking the Journal
    /// version
    fn init_up(&self) -> PersistenceResult<i64> {
        let count = self
            .conn()
            .execute("CREATE TABLE jrnl_schema (version INTEGER NOT NULL)", [])?;
        assert_eq!(count, 0);

        let count = self
            .conn()
            .execute("INSERT INTO jrnl_schema (version) VALUES (0)", [])?;
        assert_eq!(count, 1);

        Ok(0)
    }

    /// adds the changesets table, the main and single table for the history
    /// of changes to a zone. Each row is one serialized changeset.
    fn changesets_up(&self) -> PersistenceResult<i64> {
        // we'll be using rowid for our primary key, basically:
        // `rowid INTEGER PRIMARY KEY ASC`
        let count = self.conn().execute(
            "CREATE TABLE changesets (
                key            INTEGER NOT NULL,
                serial_from    INTEGER NOT NULL,
                serial_to      INTEGER NOT NULL,
                flags          INTEGER NOT NULL,
                payload        BLOB NOT NULL
            )",
            [],
        )?;
        assert_eq!(count, 1);

        Ok(1)
    }
}

/// A writable region reserved in the journal under a key, finalized by
/// [`Journal::unmap`]
pub struct JournalRegion {
    key: JournalKey,
    buf: Vec<u8>,
}

impl JournalRegion {
    /// The key this region was reserved under
    pub fn key(&self) -> JournalKey {
        self.key
    }

    /// Copies `bytes` into the region; the length must match the reserved
    /// size exactly
    pub fn write(&mut self, bytes: &[u8]) -> PersistenceResult<()> {
        if bytes.len() != self.buf.len() {
            return Err(PersistenceErrorKind::WrongWriteSize {
                got: bytes.len(),
                expect: self.buf.len(),
            }
            .into());
        }

        self.buf.copy_from_slice(bytes);
        Ok(())
    }
}

/// An open journal transaction.
///
/// Must be finished through [`Transaction::commit`] or
/// [`Transaction::rollback`]; dropping an unfinished transaction rolls it
/// back.
pub struct Transaction<'j> {
    journal: &'j Journal,
    finished: bool,
}

impl Transaction<'_> {
    /// Makes every entry stored during the transaction visible to readers
    pub fn commit(mut self) -> PersistenceResult<()> {
        self.finished = true;
        self.journal.commit_trans()
    }

    /// Discards every entry stored during the transaction
    pub fn rollback(mut self) -> PersistenceResult<()> {
        self.finished = true;
        self.journal.rollback_trans()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.journal.rollback_trans() {
                error!("failed to roll back abandoned journal transaction: {e}");
            }
        }
    }
}

/// A single entry read out of the journal
#[derive(Debug, Clone)]
pub struct JournalEntry {
    row_id: i64,
    key: JournalKey,
    flags: u32,
    payload: Vec<u8>,
}

impl JournalEntry {
    /// The serial-pair key of the stored changeset
    pub fn key(&self) -> JournalKey {
        self.key
    }

    /// True when the entry was committed completely
    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    /// True when the entry is not yet reflected in the on-disk zonefile
    pub fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    /// True when the entry belongs to a transaction that is still open
    pub fn in_transaction(&self) -> bool {
        self.flags & FLAG_TRANS != 0
    }

    /// The serialized changeset
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Flag-level view of a journal entry handed to [`Journal::walk`] visitors
#[derive(Debug)]
pub struct JournalEntryMeta {
    key: JournalKey,
    flags: u32,
}

impl JournalEntryMeta {
    /// The serial-pair key of the stored changeset
    pub fn key(&self) -> JournalKey {
        self.key
    }

    /// True when the entry was committed completely
    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    /// True when the entry is not yet reflected in the on-disk zonefile
    pub fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    /// Marks the entry as reflected in the on-disk zonefile
    pub fn clear_dirty(&mut self) {
        self.flags &= !FLAG_DIRTY;
    }
}

/// Returns an iterator over the entries of a Journal
///
/// Useful for replaying a journal to reconstruct a zone from disk
#[derive(Debug)]
pub struct JournalIter<'j> {
    journal: &'j Journal,
    current_row_id: i64,
}

impl Iterator for JournalIter<'_> {
    type Item = JournalEntry;

    fn next(&mut self) -> Option<Self::Item> {
        match self.journal.select_entry(self.current_row_id + 1) {
            Ok(Some(entry)) => {
                self.current_row_id = entry.row_id;
                Some(entry)
            }
            Ok(None) => None,
            Err(err) => {
                error!("persistence error while iterating over journal: {}", err);
                None
            }
        }
    }
}
