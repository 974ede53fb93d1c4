//! Ledger store — factor events, versioned head snapshots, per-series head
//! time and fingerprint.
//!
//! Two flavours share one in-memory index:
//! - `LedgerStore::in_memory()` — nothing touches disk
//! - `LedgerStore::open(path)` — every committed transaction is appended to a
//!   JSONL journal as one line, and replayed on open
//!
//! All writes go through a `LedgerTxn` from `connect()`. A transaction stages
//! operations and applies them in one step on `commit()`; readers never see a
//! half-applied batch. Dropping a transaction discards it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use structlab_core::{FactorEvent, Time};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("ledger serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt journal line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    /// A lock was poisoned, or a failed journal append could not be undone.
    #[error("ledger poisoned by an earlier failure")]
    Poisoned,
}

/// A persisted event with its store-assigned insertion sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: u64,
    pub event: FactorEvent,
}

/// One version of a factor's head payload at a candle time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadSnapshot {
    pub series_id: String,
    pub factor_name: String,
    pub candle_time: Time,
    pub seq: u32,
    pub payload: Value,
}

/// The fingerprint a series' derived history was built under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesFingerprint {
    pub series_id: String,
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

/// Journalled write operation. Replaying the ops of every line in order
/// reproduces the in-memory state exactly, `seq` values included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LedgerOp {
    ClearSeries {
        series_id: String,
    },
    InsertEvents {
        events: Vec<FactorEvent>,
    },
    InsertHead {
        series_id: String,
        factor_name: String,
        candle_time: Time,
        payload: Value,
    },
    UpsertHeadTime {
        series_id: String,
        time: Time,
    },
    SetFingerprint {
        record: SeriesFingerprint,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    ops: Vec<LedgerOp>,
}

// ── In-memory index ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SeriesLedger {
    events: BTreeMap<(Time, u64), FactorEvent>,
    /// `(factor_name, event_key)` uniqueness index.
    keys: HashSet<(String, String)>,
    heads: HashMap<String, BTreeMap<(Time, u32), Value>>,
    head_time: Option<Time>,
    fingerprint: Option<SeriesFingerprint>,
}

impl SeriesLedger {
    fn has_event(&self, factor: &str, key: &str) -> bool {
        self.keys.contains(&(factor.to_string(), key.to_string()))
    }

    fn latest_head_at(&self, factor: &str, time: Time) -> Option<(u32, &Value)> {
        self.heads
            .get(factor)?
            .range((time, 0)..=(time, u32::MAX))
            .next_back()
            .map(|(&(_, seq), payload)| (seq, payload))
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    series: HashMap<String, SeriesLedger>,
    next_seq: u64,
}

impl LedgerState {
    fn apply(&mut self, op: LedgerOp) {
        match op {
            LedgerOp::ClearSeries { series_id } => {
                // The fingerprint outlives a clear; a rebuild sets it right after.
                if let Some(ledger) = self.series.remove(&series_id) {
                    if let Some(fp) = ledger.fingerprint {
                        self.series.entry(series_id).or_default().fingerprint = Some(fp);
                    }
                }
            }
            LedgerOp::InsertEvents { events } => {
                for event in events {
                    let ledger = self.series.entry(event.series_id.clone()).or_default();
                    let key = (event.factor_name.clone(), event.event_key.clone());
                    if ledger.keys.contains(&key) {
                        continue;
                    }
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    ledger.keys.insert(key);
                    ledger.events.insert((event.candle_time, seq), event);
                }
            }
            LedgerOp::InsertHead {
                series_id,
                factor_name,
                candle_time,
                payload,
            } => {
                let ledger = self.series.entry(series_id).or_default();
                let next = match ledger.latest_head_at(&factor_name, candle_time) {
                    Some((_, latest)) if *latest == payload => return,
                    Some((seq, _)) => seq + 1,
                    None => 1,
                };
                ledger
                    .heads
                    .entry(factor_name)
                    .or_default()
                    .insert((candle_time, next), payload);
            }
            LedgerOp::UpsertHeadTime { series_id, time } => {
                let ledger = self.series.entry(series_id).or_default();
                ledger.head_time = Some(ledger.head_time.map_or(time, |h| h.max(time)));
            }
            LedgerOp::SetFingerprint { record } => {
                let series_id = record.series_id.clone();
                self.series.entry(series_id).or_default().fingerprint = Some(record);
            }
        }
    }
}

// ── Journal ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    file: File,
    /// Byte length of the last acknowledged commit. Anything past it is not
    /// part of the ledger.
    committed_len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

impl Journal {
    /// Append one line. On failure the file is cut back to `committed_len`,
    /// so a later commit never lands on the same line as a partial write.
    fn append(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        if self.poisoned {
            return Err(StoreError::Poisoned);
        }
        let line = serde_json::to_string(entry)?;

        let on_disk = self.file.metadata()?.len();
        if on_disk != self.committed_len {
            warn!(
                path = %self.path.display(),
                stray_bytes = on_disk.abs_diff(self.committed_len),
                "journal grew past the last commit, truncating"
            );
            self.truncate()?;
        }

        match self.write_line(&line) {
            Ok(()) => {
                self.committed_len += line.len() as u64 + 1;
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "journal append failed, rolling back");
                self.truncate()?;
                Err(e.into())
            }
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        self.file.sync_data()
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        if let Err(e) = self.file.set_len(self.committed_len) {
            self.poisoned = true;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Replay a journal file into `state`. Returns the byte length of the valid
/// prefix and the number of lines applied.
fn replay_journal(bytes: &[u8], state: &mut LedgerState) -> Result<(usize, usize), StoreError> {
    let mut offset = 0;
    let mut applied = 0;
    let mut line_no = 0;
    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            // Unterminated tail: a commit that never finished.
            return Ok((offset, applied));
        };
        let line = &rest[..newline];
        let next = offset + newline + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }
        match serde_json::from_slice::<JournalEntry>(line) {
            Ok(entry) => {
                for op in entry.ops {
                    state.apply(op);
                }
                applied += 1;
                offset = next;
            }
            Err(_) if next == bytes.len() => return Ok((offset, applied)),
            Err(e) => {
                return Err(StoreError::Corrupt {
                    line: line_no,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok((offset, applied))
}

// ── Store ────────────────────────────────────────────────────────────

/// Factor ledger. Cheap to share by reference; internally synchronized.
#[derive(Debug)]
pub struct LedgerStore {
    state: RwLock<LedgerState>,
    journal: Option<Mutex<Journal>>,
}

impl LedgerStore {
    /// A store that lives and dies with the process.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            journal: None,
        }
    }

    /// Open (or create) a journal-backed store at `path`.
    ///
    /// A torn final line is discarded and the file truncated to the last
    /// complete transaction. A bad line anywhere else is `Corrupt`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut state = LedgerState::default();
        let existing = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (valid_len, applied) = replay_journal(&existing, &mut state)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if valid_len < existing.len() {
            warn!(
                path = %path.display(),
                discarded_bytes = existing.len() - valid_len,
                "discarding torn journal tail"
            );
            file.set_len(valid_len as u64)?;
        }
        info!(
            path = %path.display(),
            transactions = applied,
            series = state.series.len(),
            "ledger journal replayed"
        );

        Ok(Self {
            state: RwLock::new(state),
            journal: Some(Mutex::new(Journal {
                path,
                file,
                committed_len: valid_len as u64,
                poisoned: false,
            })),
        })
    }

    /// Journal path, if this store is durable.
    pub fn path(&self) -> Option<PathBuf> {
        let journal = self.journal.as_ref()?;
        let guard = journal.lock().ok()?;
        Some(guard.path.clone())
    }

    /// Begin a write transaction.
    pub fn connect(&self) -> LedgerTxn<'_> {
        LedgerTxn {
            store: self,
            ops: Vec::new(),
            cleared: HashSet::new(),
            staged_keys: HashSet::new(),
            staged_heads: HashMap::new(),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LedgerState>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn commit_ops(&self, ops: Vec<LedgerOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        // Hold the state lock across journal append and apply, so journal
        // order is apply order.
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let entry = JournalEntry { ops };
        if let Some(journal) = &self.journal {
            let mut journal = journal.lock().map_err(|_| StoreError::Poisoned)?;
            journal.append(&entry)?;
        }
        debug!(ops = entry.ops.len(), "ledger commit");
        for op in entry.ops {
            state.apply(op);
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn head_time(&self, series_id: &str) -> Result<Option<Time>, StoreError> {
        Ok(self
            .read()?
            .series
            .get(series_id)
            .and_then(|s| s.head_time))
    }

    pub fn get_fingerprint(&self, series_id: &str) -> Result<Option<SeriesFingerprint>, StoreError> {
        Ok(self
            .read()?
            .series
            .get(series_id)
            .and_then(|s| s.fingerprint.clone()))
    }

    /// Events with `start <= candle_time <= end`, ordered by
    /// `(candle_time, seq)`, at most `limit` rows.
    pub fn get_events_between_times(
        &self,
        series_id: &str,
        factor: Option<&str>,
        start: Time,
        end: Time,
        limit: usize,
    ) -> Result<Vec<FactorEvent>, StoreError> {
        Ok(self
            .get_events_page(series_id, factor, start, end, None, limit)?
            .into_iter()
            .map(|row| row.event)
            .collect())
    }

    /// One page of events strictly after `cursor` (a `(candle_time, seq)`
    /// position), bounded by `[start, end]`.
    pub fn get_events_page(
        &self,
        series_id: &str,
        factor: Option<&str>,
        start: Time,
        end: Time,
        cursor: Option<(Time, u64)>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        if start > end || limit == 0 {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let Some(ledger) = state.series.get(series_id) else {
            return Ok(Vec::new());
        };
        let lower = match cursor {
            Some(c) if c >= (start, 0) => Bound::Excluded(c),
            _ => Bound::Included((start, 0)),
        };
        let upper = Bound::Included((end, u64::MAX));
        Ok(ledger
            .events
            .range((lower, upper))
            .filter(|(_, e)| factor.map_or(true, |f| e.factor_name == f))
            .take(limit)
            .map(|(&(_, seq), e)| StoredEvent {
                seq,
                event: e.clone(),
            })
            .collect())
    }

    /// Cursor-based page iterator over `[start, end]`. Never truncates.
    pub fn iter_events_between_times<'s>(
        &'s self,
        series_id: &str,
        factor: Option<&str>,
        start: Time,
        end: Time,
        page_size: usize,
    ) -> EventPager<'s> {
        EventPager {
            store: self,
            series_id: series_id.to_string(),
            factor: factor.map(str::to_string),
            start,
            end,
            page_size: page_size.max(1),
            cursor: None,
            done: false,
        }
    }

    /// Latest snapshot with `candle_time <= time`; ties go to the highest seq.
    pub fn get_head_at_or_before(
        &self,
        series_id: &str,
        factor: &str,
        time: Time,
    ) -> Result<Option<HeadSnapshot>, StoreError> {
        let state = self.read()?;
        let found = state
            .series
            .get(series_id)
            .and_then(|s| s.heads.get(factor))
            .and_then(|heads| heads.range(..=(time, u32::MAX)).next_back());
        Ok(found.map(|(&(candle_time, seq), payload)| HeadSnapshot {
            series_id: series_id.to_string(),
            factor_name: factor.to_string(),
            candle_time,
            seq,
            payload: payload.clone(),
        }))
    }

    pub fn series_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.read()?.series.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn event_count(&self, series_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .read()?
            .series
            .get(series_id)
            .map_or(0, |s| s.events.len()))
    }

    // ── Single-operation writes ──────────────────────────────────────

    pub fn insert_events(&self, events: &[FactorEvent]) -> Result<usize, StoreError> {
        let mut txn = self.connect();
        let inserted = txn.insert_events(events)?;
        txn.commit()?;
        Ok(inserted)
    }

    pub fn insert_head_snapshot(
        &self,
        series_id: &str,
        factor: &str,
        candle_time: Time,
        payload: Value,
    ) -> Result<bool, StoreError> {
        let mut txn = self.connect();
        let written = txn.insert_head_snapshot(series_id, factor, candle_time, payload)?;
        txn.commit()?;
        Ok(written)
    }

    pub fn upsert_head_time(&self, series_id: &str, time: Time) -> Result<(), StoreError> {
        let mut txn = self.connect();
        txn.upsert_head_time(series_id, time);
        txn.commit()
    }

    pub fn clear_series(&self, series_id: &str) -> Result<(), StoreError> {
        let mut txn = self.connect();
        txn.clear_series(series_id);
        txn.commit()
    }

    pub fn set_fingerprint(&self, series_id: &str, fingerprint: &str) -> Result<(), StoreError> {
        let mut txn = self.connect();
        txn.set_fingerprint(series_id, fingerprint);
        txn.commit()
    }
}

// ── Transactions ─────────────────────────────────────────────────────

/// Staged writes. Nothing is visible until `commit()`.
pub struct LedgerTxn<'s> {
    store: &'s LedgerStore,
    ops: Vec<LedgerOp>,
    /// Series cleared earlier in this transaction; committed rows no longer count.
    cleared: HashSet<String>,
    staged_keys: HashSet<(String, String, String)>,
    staged_heads: HashMap<(String, String, Time), Value>,
}

impl LedgerTxn<'_> {
    /// Stage events, skipping any whose `(series, factor, event_key)` already
    /// exists. Returns how many will be inserted.
    pub fn insert_events(&mut self, events: &[FactorEvent]) -> Result<usize, StoreError> {
        let state = self.store.read()?;
        let mut fresh = Vec::new();
        for event in events {
            let staged = (
                event.series_id.clone(),
                event.factor_name.clone(),
                event.event_key.clone(),
            );
            if self.staged_keys.contains(&staged) {
                continue;
            }
            let committed = !self.cleared.contains(&event.series_id)
                && state
                    .series
                    .get(&event.series_id)
                    .is_some_and(|s| s.has_event(&event.factor_name, &event.event_key));
            if committed {
                continue;
            }
            self.staged_keys.insert(staged);
            fresh.push(event.clone());
        }
        drop(state);

        let inserted = fresh.len();
        if inserted > 0 {
            self.ops.push(LedgerOp::InsertEvents { events: fresh });
        }
        Ok(inserted)
    }

    /// Stage a head snapshot. Returns `false` when the payload equals the
    /// latest version at that `(series, factor, time)`.
    pub fn insert_head_snapshot(
        &mut self,
        series_id: &str,
        factor: &str,
        candle_time: Time,
        payload: Value,
    ) -> Result<bool, StoreError> {
        let slot = (series_id.to_string(), factor.to_string(), candle_time);
        let unchanged = match self.staged_heads.get(&slot) {
            Some(staged) => *staged == payload,
            None if self.cleared.contains(series_id) => false,
            None => {
                let state = self.store.read()?;
                state
                    .series
                    .get(series_id)
                    .and_then(|s| s.latest_head_at(factor, candle_time))
                    .is_some_and(|(_, latest)| *latest == payload)
            }
        };
        if unchanged {
            return Ok(false);
        }
        self.ops.push(LedgerOp::InsertHead {
            series_id: series_id.to_string(),
            factor_name: factor.to_string(),
            candle_time,
            payload: payload.clone(),
        });
        self.staged_heads.insert(slot, payload);
        Ok(true)
    }

    /// Advance the series head; merges as `max(current, time)`.
    pub fn upsert_head_time(&mut self, series_id: &str, time: Time) {
        self.ops.push(LedgerOp::UpsertHeadTime {
            series_id: series_id.to_string(),
            time,
        });
    }

    /// Wipe events, head snapshots and head time for a series.
    pub fn clear_series(&mut self, series_id: &str) {
        self.cleared.insert(series_id.to_string());
        self.staged_keys.retain(|(s, _, _)| s != series_id);
        self.staged_heads.retain(|(s, _, _), _| s != series_id);
        self.ops.push(LedgerOp::ClearSeries {
            series_id: series_id.to_string(),
        });
    }

    pub fn set_fingerprint(&mut self, series_id: &str, fingerprint: &str) {
        self.ops.push(LedgerOp::SetFingerprint {
            record: SeriesFingerprint {
                series_id: series_id.to_string(),
                fingerprint: fingerprint.to_string(),
                updated_at: Utc::now(),
            },
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Journal and apply every staged operation at once.
    pub fn commit(self) -> Result<(), StoreError> {
        self.store.commit_ops(self.ops)
    }
}

// ── Paging ───────────────────────────────────────────────────────────

/// Yields `(candle_time, seq)`-ordered pages until the window is exhausted.
pub struct EventPager<'s> {
    store: &'s LedgerStore,
    series_id: String,
    factor: Option<String>,
    start: Time,
    end: Time,
    page_size: usize,
    cursor: Option<(Time, u64)>,
    done: bool,
}

impl Iterator for EventPager<'_> {
    type Item = Result<Vec<StoredEvent>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let page = match self.store.get_events_page(
            &self.series_id,
            self.factor.as_deref(),
            self.start,
            self.end,
            self.cursor,
            self.page_size,
        ) {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if page.len() < self.page_size {
            self.done = true;
        }
        if page.is_empty() {
            return None;
        }
        self.cursor = page.last().map(|row| (row.event.candle_time, row.seq));
        Some(Ok(page))
    }
}
