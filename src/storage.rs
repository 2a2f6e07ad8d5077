//! Durable, append-only queue of fused fixes awaiting upload.
//!
//! # File Format
//! One JSON object per line:
//! - `{"op":"append","record":{...}}` for every new fix
//! - `{"op":"ack","ids":[...]}` when the server accepts a batch
//!
//! Reopening the file replays both kinds of line, so ids and the unsynced set
//! survive restarts. Only unsynced records are held in memory; synced history
//! stays in the file, and retention is left to whoever owns it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::{TrackerError, TrackerResult};
use crate::types::{FusedLocation, SourceSample, TimestampMs};

pub type RecordId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub id: RecordId,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub captured_at_ms: TimestampMs,
    pub sources_snapshot_json: String,
    pub synced: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Append { record: LocationRecord },
    Ack { ids: Vec<RecordId> },
}

/// What replay found at the end of the file.
enum JournalTail {
    /// Every line ends in a newline.
    Clean,
    /// The last line parsed but lost its newline; one must be written before
    /// the next entry.
    MissingNewline,
    /// A partial write. The file is cut back to this many bytes.
    Torn { keep_bytes: u64 },
}

pub struct LocationPersistenceQueue {
    journal: Option<File>,
    fsync: bool,
    pending: BTreeMap<RecordId, LocationRecord>,
    next_id: RecordId,
}

impl LocationPersistenceQueue {
    /// Queue without a backing file (tests, or when no data directory is configured).
    pub fn in_memory() -> Self {
        Self {
            journal: None,
            fsync: false,
            pending: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Open or create the journal at `path` and replay its contents.
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> TrackerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    TrackerError::PersistenceFailure(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }

        let mut queue = Self::in_memory();
        queue.fsync = fsync;
        let tail = if path.exists() {
            queue.replay(path)?
        } else {
            JournalTail::Clean
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TrackerError::PersistenceFailure(format!("open {}: {}", path.display(), e)))?;

        match tail {
            JournalTail::Clean => {}
            JournalTail::MissingNewline => {
                file.write_all(b"\n")
                    .map_err(|e| TrackerError::PersistenceFailure(format!("repair {}: {}", path.display(), e)))?;
            }
            JournalTail::Torn { keep_bytes } => {
                log::warn!("Truncating torn journal tail in {} to {} bytes", path.display(), keep_bytes);
                file.set_len(keep_bytes)
                    .map_err(|e| TrackerError::PersistenceFailure(format!("truncate {}: {}", path.display(), e)))?;
            }
        }
        queue.journal = Some(file);

        log::info!(
            "Location queue opened: {} unsynced records, next id {}",
            queue.pending.len(),
            queue.next_id
        );
        Ok(queue)
    }

    fn replay(&mut self, path: &Path) -> TrackerResult<JournalTail> {
        let file = File::open(path)
            .map_err(|e| TrackerError::PersistenceFailure(format!("read {}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);

        let mut buf = Vec::new();
        let mut complete_bytes = 0u64;
        let mut line_no = 0usize;
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| TrackerError::PersistenceFailure(format!("read {}: {}", path.display(), e)))?;
            if n == 0 {
                return Ok(JournalTail::Clean);
            }
            line_no += 1;
            let terminated = buf.last() == Some(&b'\n');

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim();
            if line.is_empty() {
                complete_bytes += n as u64;
                continue;
            }

            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => {
                    self.apply(entry);
                    if !terminated {
                        return Ok(JournalTail::MissingNewline);
                    }
                }
                Err(_) if !terminated => {
                    return Ok(JournalTail::Torn {
                        keep_bytes: complete_bytes,
                    });
                }
                Err(e) => {
                    log::warn!("Skipping corrupt journal line {} in {}: {}", line_no, path.display(), e);
                }
            }
            complete_bytes += n as u64;
        }
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Append { record } => {
                self.next_id = self.next_id.max(record.id + 1);
                if !record.synced {
                    self.pending.insert(record.id, record);
                }
            }
            JournalEntry::Ack { ids } => {
                for id in ids {
                    self.pending.remove(&id);
                }
            }
        }
    }

    fn write_entry(&mut self, entry: &JournalEntry) -> TrackerResult<()> {
        let Some(file) = self.journal.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_string(entry)
            .map_err(|e| TrackerError::PersistenceFailure(format!("encode: {}", e)))?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|e| TrackerError::PersistenceFailure(format!("write: {}", e)))?;
        if self.fsync {
            file.sync_data()
                .map_err(|e| TrackerError::PersistenceFailure(format!("fsync: {}", e)))?;
        }
        Ok(())
    }

    /// Durably record a fused fix. Works offline; the record starts unsynced.
    /// The in-memory state only changes once the journal write succeeded.
    pub fn append(&mut self, fix: &FusedLocation, sources: &[SourceSample]) -> TrackerResult<LocationRecord> {
        let sources_snapshot_json = serde_json::to_string(sources)
            .map_err(|e| TrackerError::PersistenceFailure(format!("encode sources: {}", e)))?;

        let record = LocationRecord {
            id: self.next_id,
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_m: fix.accuracy_m,
            captured_at_ms: fix.produced_at_ms,
            sources_snapshot_json,
            synced: false,
        };

        self.write_entry(&JournalEntry::Append { record: record.clone() })?;

        self.next_id += 1;
        self.pending.insert(record.id, record.clone());
        Ok(record)
    }

    /// Up to `limit` oldest unsynced records.
    pub fn drain_batch(&self, limit: usize) -> Vec<LocationRecord> {
        self.pending.values().take(limit).cloned().collect()
    }

    /// Mark exactly `ids` as synced and release them from memory. Already
    /// synced and unknown ids are ignored, so repeating an acknowledgment
    /// changes nothing. Returns how many records flipped.
    pub fn acknowledge(&mut self, ids: &[RecordId]) -> TrackerResult<usize> {
        let mut flipping: Vec<RecordId> = ids.iter().copied().filter(|id| self.pending.contains_key(id)).collect();
        flipping.sort_unstable();
        flipping.dedup();
        if flipping.is_empty() {
            return Ok(0);
        }

        self.write_entry(&JournalEntry::Ack { ids: flipping.clone() })?;
        for id in &flipping {
            self.pending.remove(id);
        }
        Ok(flipping.len())
    }

    pub fn unsynced_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoPoint;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "location_fusion_{}_{}_{}.jsonl",
            name,
            std::process::id(),
            nanos
        ))
    }

    fn fix(i: u64) -> FusedLocation {
        FusedLocation {
            latitude: 37.0 + i as f64 * 1e-4,
            longitude: -122.0,
            accuracy_m: 5.0,
            produced_at_ms: 1_000 * i,
        }
    }

    fn sources() -> Vec<SourceSample> {
        vec![SourceSample::Satellite {
            position: GeoPoint::new(37.0, -122.0),
            accuracy_m: 5.0,
            captured_at_ms: 1_000,
        }]
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let mut queue = LocationPersistenceQueue::in_memory();
        let ids: Vec<RecordId> = (1..=5)
            .map(|i| queue.append(&fix(i), &sources()).unwrap().id)
            .collect();
        assert_eq!(queue.unsynced_count(), 5);

        assert_eq!(queue.acknowledge(&ids[..3]).unwrap(), 3);
        assert_eq!(queue.unsynced_count(), 2);

        assert_eq!(queue.acknowledge(&ids[..3]).unwrap(), 0);
        assert_eq!(queue.unsynced_count(), 2);
    }

    #[test]
    fn test_drain_batch_returns_oldest_unsynced() {
        let mut queue = LocationPersistenceQueue::in_memory();
        for i in 1..=6 {
            queue.append(&fix(i), &sources()).unwrap();
        }
        queue.acknowledge(&[1, 2]).unwrap();

        let batch = queue.drain_batch(3);
        let ids: Vec<RecordId> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(batch.iter().all(|r| !r.synced));

        // Draining does not consume
        assert_eq!(queue.unsynced_count(), 4);
    }

    #[test]
    fn test_unknown_ids_ignored() {
        let mut queue = LocationPersistenceQueue::in_memory();
        queue.append(&fix(1), &sources()).unwrap();
        assert_eq!(queue.acknowledge(&[42, 99]).unwrap(), 0);
        assert_eq!(queue.unsynced_count(), 1);
    }

    #[test]
    fn test_record_carries_sources_snapshot() {
        let mut queue = LocationPersistenceQueue::in_memory();
        let record = queue.append(&fix(3), &sources()).unwrap();
        assert!(!record.synced);
        assert_eq!(record.captured_at_ms, 3_000);
        assert!(record.sources_snapshot_json.contains("satellite"));
    }

    #[test]
    fn test_acknowledged_records_leave_memory() {
        let mut queue = LocationPersistenceQueue::in_memory();
        for i in 1..=3 {
            queue.append(&fix(i), &sources()).unwrap();
        }
        queue.acknowledge(&[1, 2]).unwrap();
        assert_eq!(queue.pending.len(), 1);
        assert!(queue.pending.contains_key(&3));
    }

    #[test]
    fn test_journal_replay_restores_state() {
        let path = temp_path("replay");
        {
            let mut queue = LocationPersistenceQueue::open(&path, false).unwrap();
            for i in 1..=4 {
                queue.append(&fix(i), &sources()).unwrap();
            }
            queue.acknowledge(&[1, 3]).unwrap();
        }

        let mut reopened = LocationPersistenceQueue::open(&path, false).unwrap();
        assert_eq!(reopened.unsynced_count(), 2);
        let ids: Vec<RecordId> = reopened.drain_batch(10).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 4]);

        let next = reopened.append(&fix(5), &sources()).unwrap();
        assert_eq!(next.id, 5);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_line_skipped() {
        let path = temp_path("corrupt");
        {
            let mut queue = LocationPersistenceQueue::open(&path, false).unwrap();
            queue.append(&fix(1), &sources()).unwrap();
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"not json\n").unwrap();
            queue.append(&fix(2), &sources()).unwrap();
        }

        let queue = LocationPersistenceQueue::open(&path, false).unwrap();
        assert_eq!(queue.unsynced_count(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_append_after_torn_tail_survives_restart() {
        let path = temp_path("torn");
        {
            let mut queue = LocationPersistenceQueue::open(&path, false).unwrap();
            queue.append(&fix(1), &sources()).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"op\":\"append\",\"rec").unwrap();
        }

        {
            let mut queue = LocationPersistenceQueue::open(&path, false).unwrap();
            assert_eq!(queue.unsynced_count(), 1);
            let record = queue.append(&fix(2), &sources()).unwrap();
            assert_eq!(record.id, 2);
        }

        let queue = LocationPersistenceQueue::open(&path, false).unwrap();
        assert_eq!(queue.unsynced_count(), 2);
        let ids: Vec<RecordId> = queue.drain_batch(10).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_complete_entry_without_newline_is_kept() {
        let path = temp_path("no_newline");
        {
            let mut queue = LocationPersistenceQueue::open(&path, false).unwrap();
            queue.append(&fix(1), &sources()).unwrap();
        }
        // Strip the trailing newline from an otherwise complete entry
        let content = fs::read(&path).unwrap();
        fs::write(&path, &content[..content.len() - 1]).unwrap();

        {
            let mut queue = LocationPersistenceQueue::open(&path, false).unwrap();
            assert_eq!(queue.unsynced_count(), 1);
            queue.append(&fix(2), &sources()).unwrap();
        }

        let queue = LocationPersistenceQueue::open(&path, false).unwrap();
        assert_eq!(queue.unsynced_count(), 2);
        assert_eq!(queue.next_id, 3);

        let _ = fs::remove_file(&path);
    }
}
