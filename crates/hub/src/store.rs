//! Append-only JSON-lines history of `(report, command)` pairs.
//!
//! Records go to `<dir>/store.jsonl`. Once that file holds
//! `max_records_per_segment` records it is renamed to
//! `store_<unix seconds of its last record>.jsonl` and a fresh active file is
//! started.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use growbox_control::{ReconcilerCommand, SensorReport};

const ACTIVE_FILE: &str = "store.jsonl";
const SEGMENT_PREFIX: &str = "store_";
const SEGMENT_SUFFIX: &str = ".jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unix seconds.
    pub ts: f64,
    pub sensor_report: SensorReport,
    pub reconciler_command: ReconcilerCommand,
}

impl Record {
    pub fn now(sensor_report: SensorReport, reconciler_command: ReconcilerCommand) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            ts: now.unix_timestamp_nanos() as f64 / 1e9,
            sensor_report,
            reconciler_command,
        }
    }
}

pub struct Store {
    dir: PathBuf,
    max_records: usize,
    active_records: usize,
    last_ts: Option<f64>,
}

impl Store {
    /// Open (creating if needed) the store directory and pick up the count of
    /// any active segment left by a previous run.
    pub async fn open(dir: impl Into<PathBuf>, max_records: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create store dir: {}", dir.display()))?;

        let mut store = Self {
            dir,
            max_records: max_records.max(1),
            active_records: 0,
            last_ts: None,
        };

        let active = store.active_path();
        if fs::try_exists(&active).await.unwrap_or(false) {
            let records = read_segment(&active).await?;
            store.active_records = records.len();
            store.last_ts = records.last().map(|r| r.ts);
        }

        tracing::info!(
            dir = %store.dir.display(),
            active_records = store.active_records,
            "store opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    /// Append one record, rotating the active segment first if it is full.
    pub async fn append(&mut self, record: &Record) -> Result<()> {
        if self.active_records >= self.max_records {
            self.rotate().await?;
        }

        let mut line = serde_json::to_string(record).context("failed to encode record")?;
        line.push('\n');

        let path = self.active_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.flush().await?;

        self.active_records += 1;
        self.last_ts = Some(record.ts);
        Ok(())
    }

    async fn rotate(&mut self) -> Result<()> {
        let mut stamp = self.last_ts.unwrap_or(0.0) as i64;
        let mut target = self.segment_path(stamp);
        while fs::try_exists(&target).await.unwrap_or(false) {
            stamp += 1;
            target = self.segment_path(stamp);
        }

        let active = self.active_path();
        fs::rename(&active, &target).await.with_context(|| {
            format!(
                "failed to rotate {} to {}",
                active.display(),
                target.display()
            )
        })?;

        tracing::info!(segment = %target.display(), records = self.active_records, "segment rotated");
        self.active_records = 0;
        Ok(())
    }

    fn segment_path(&self, stamp: i64) -> PathBuf {
        self.dir
            .join(format!("{SEGMENT_PREFIX}{stamp}{SEGMENT_SUFFIX}"))
    }
}

/// Timestamp encoded in a rotated segment file name.
pub fn segment_stamp(path: &Path) -> Option<i64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Rotated segments in `dir`, oldest first (by their numeric timestamp).
pub async fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list store dir: {}", dir.display()))?;

    let mut segments: Vec<(i64, PathBuf)> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(stamp) = segment_stamp(&path) {
            segments.push((stamp, path));
        }
    }
    segments.sort_by_key(|(stamp, _)| *stamp);
    Ok(segments.into_iter().map(|(_, p)| p).collect())
}

/// The newest `n` rotated segments, newest first.
pub async fn last_segments(dir: &Path, n: usize) -> Result<Vec<PathBuf>> {
    let mut segments = list_segments(dir).await?;
    segments.reverse();
    segments.truncate(n);
    Ok(segments)
}

/// Parse every record in a segment. Lines that fail to parse (e.g. a partial
/// final line after a crash) are skipped with a warning.
pub async fn read_segment(path: &Path) -> Result<Vec<Record>> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read segment: {}", path.display()))?;

    let mut records = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(r) => records.push(r),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = lineno + 1,
                error = %e,
                "skipping unreadable store record"
            ),
        }
    }
    Ok(records)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "growbox-store-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn record(ts: f64, moisture: i32) -> Record {
        Record {
            ts,
            sensor_report: SensorReport::new(moisture, 20, 50, 18, 55),
            reconciler_command: ReconcilerCommand::OFF,
        }
    }

    // -- Append + rotation ------------------------------------------------

    #[tokio::test]
    async fn append_writes_json_lines() {
        let dir = temp_dir("append");
        let mut store = Store::open(&dir, 10).await.unwrap();
        store.append(&record(100.5, 30)).await.unwrap();
        store.append(&record(101.5, 31)).await.unwrap();

        let text = std::fs::read_to_string(dir.join(ACTIVE_FILE)).unwrap();
        assert_eq!(text.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["ts"], 100.5);
        assert_eq!(first["sensor_report"]["moisture"], 30);
        assert_eq!(first["reconciler_command"]["pump_level"], 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn rotates_when_full() {
        let dir = temp_dir("rotate");
        let mut store = Store::open(&dir, 2).await.unwrap();
        for (i, ts) in [10.0, 20.7, 30.0, 40.0, 50.0].into_iter().enumerate() {
            store.append(&record(ts, i as i32)).await.unwrap();
        }

        let segments = list_segments(store.dir()).await.unwrap();
        let names: Vec<_> = segments
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["store_20.jsonl", "store_40.jsonl"]);

        let active = read_segment(&dir.join(ACTIVE_FILE)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ts, 50.0);

        let first = read_segment(&segments[0]).await.unwrap();
        assert_eq!(first, vec![record(10.0, 0), record(20.7, 1)]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn reopen_resumes_active_count() {
        let dir = temp_dir("reopen");
        {
            let mut store = Store::open(&dir, 3).await.unwrap();
            store.append(&record(1.0, 1)).await.unwrap();
            store.append(&record(2.0, 2)).await.unwrap();
        }
        let mut store = Store::open(&dir, 3).await.unwrap();
        store.append(&record(3.0, 3)).await.unwrap();
        assert!(list_segments(store.dir()).await.unwrap().is_empty());

        store.append(&record(4.0, 4)).await.unwrap();
        let segments = list_segments(store.dir()).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segment_stamp(&segments[0]), Some(3));

        std::fs::remove_dir_all(&dir).ok();
    }

    // -- Listing ----------------------------------------------------------

    #[tokio::test]
    async fn segments_sort_numerically() {
        let dir = temp_dir("sort");
        std::fs::create_dir_all(&dir).unwrap();
        for name in [
            "store_900.jsonl",
            "store_1000.jsonl",
            "store_95.jsonl",
            "store.jsonl",
            "notes.txt",
            "store_abc.jsonl",
        ] {
            std::fs::write(dir.join(name), "").unwrap();
        }
        let store = Store::open(&dir, 10).await.unwrap();

        let all: Vec<_> = list_segments(store.dir())
            .await
            .unwrap()
            .iter()
            .filter_map(|p| segment_stamp(p))
            .collect();
        assert_eq!(all, vec![95, 900, 1000]);

        let newest: Vec<_> = last_segments(store.dir(), 2)
            .await
            .unwrap()
            .iter()
            .filter_map(|p| segment_stamp(p))
            .collect();
        assert_eq!(newest, vec![1000, 900]);

        assert_eq!(last_segments(store.dir(), 50).await.unwrap().len(), 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn unreadable_lines_are_skipped() {
        let dir = temp_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        let good = serde_json::to_string(&record(5.0, 42)).unwrap();
        let path = dir.join("store_5.jsonl");
        std::fs::write(&path, format!("{good}\n{{\"ts\": 6.0, \"sensor_rep\n")).unwrap();

        let records = read_segment(&path).await.unwrap();
        assert_eq!(records, vec![record(5.0, 42)]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
