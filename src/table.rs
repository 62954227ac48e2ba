//! Persisted listing table: load, merge with location dedup, atomic save.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::types::ListingRecord;

/// Header row of every persisted table file.
pub const HEADER: [&str; 6] = [
    "latitude",
    "longitude",
    "price",
    "area",
    "price_per_area",
    "time_run",
];

/// Most decimals a rounded dedup key may use. Finer keys stop being
/// meaningful for degree coordinates.
pub const MAX_DEDUP_DECIMALS: u32 = 12;

/// How two rows are judged to describe the same location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupKey {
    /// Bitwise-equal coordinates (`-0.0` and `0.0` are equal).
    #[default]
    Exact,
    /// Coordinates rounded to `decimals` places.
    Rounded { decimals: u32 },
}

impl DedupKey {
    /// Rounded key, or an error when `decimals` exceeds [`MAX_DEDUP_DECIMALS`].
    pub fn rounded(decimals: u32) -> Result<Self, String> {
        if decimals > MAX_DEDUP_DECIMALS {
            return Err(format!(
                "dedup key rounding to {} decimals exceeds the maximum of {}",
                decimals, MAX_DEDUP_DECIMALS
            ));
        }
        Ok(DedupKey::Rounded { decimals })
    }

    fn of(&self, record: &ListingRecord) -> (u64, u64) {
        match *self {
            DedupKey::Exact => (bits(record.latitude), bits(record.longitude)),
            DedupKey::Rounded { decimals } => {
                // Rounded back to degrees so the key never saturates an integer.
                let scale = 10f64.powi(decimals.min(MAX_DEDUP_DECIMALS) as i32);
                let round = |v: f64| bits((v * scale).round() / scale);
                (round(record.latitude), round(record.longitude))
            }
        }
    }
}

/// `-0.0` and `0.0` share a key.
fn bits(v: f64) -> u64 {
    (v + 0.0).to_bits()
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DedupKey::Exact => write!(f, "exact"),
            DedupKey::Rounded { decimals } => write!(f, "rounded:{}", decimals),
        }
    }
}

impl std::str::FromStr for DedupKey {
    type Err = String;

    /// Accepts `exact`, `rounded` (two decimals) or `rounded:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "exact" => Ok(DedupKey::Exact),
            None if s == "rounded" => Ok(DedupKey::Rounded { decimals: 2 }),
            Some(("rounded", n)) => n
                .parse()
                .map_err(|_| format!("invalid decimals in dedup key '{}'", s))
                .and_then(DedupKey::rounded),
            _ => Err(format!("unknown dedup key '{}' (expected exact, rounded or rounded:N)", s)),
        }
    }
}

/// Ordered listing rows for one market and transaction kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingTable {
    pub rows: Vec<ListingRecord>,
}

/// Row counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub previous: usize,
    pub incoming: usize,
    pub merged: usize,
}

impl ListingTable {
    pub fn new(rows: Vec<ListingRecord>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Read a table file. A missing or blank file is an empty table.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let read_err = |reason: String| PipelineError::StorageRead {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no table yet, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(read_err(e.to_string())),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            debug!(path = %path.display(), "table file is empty, starting empty");
            return Ok(Self::default());
        }

        let mut rdr = csv::Reader::from_reader(bytes.as_slice());
        let rows = rdr
            .deserialize::<ListingRecord>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| read_err(e.to_string()))?;

        debug!(path = %path.display(), rows = rows.len(), "loaded table");
        Ok(Self { rows })
    }

    /// Replace the file at `path` with this table.
    ///
    /// Rows go to a temp file in the same directory which is then renamed
    /// over the target, so a failed write leaves the old file in place.
    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        replace_file(path, |w| self.write_rows(w))?;
        debug!(path = %path.display(), rows = self.rows.len(), "saved table");
        Ok(())
    }

    /// Write the header and every row as CSV.
    pub fn write_rows<W: Write>(&self, w: W) -> Result<(), csv::Error> {
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(w);
        wtr.write_record(HEADER)?;
        for row in &self.rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Fill a temp file next to `path` with `fill`, then rename it over
/// `path`. If `fill` fails the temp file is removed and `path` is not
/// touched.
fn replace_file<F>(path: &Path, fill: F) -> Result<(), PipelineError>
where
    F: FnOnce(&mut fs::File) -> Result<(), csv::Error>,
{
    let write_err = |reason: String| PipelineError::StorageWrite {
        path: path.to_path_buf(),
        reason,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| write_err(e.to_string()))?;

    fill(tmp.as_file_mut()).map_err(|e| write_err(e.to_string()))?;
    tmp.as_file().sync_all().map_err(|e| write_err(e.to_string()))?;
    tmp.persist(path).map_err(|e| write_err(e.error.to_string()))?;
    Ok(())
}

/// Append `incoming` after `existing` and keep the last row per key.
///
/// Surviving rows keep the relative order of their last occurrence.
pub fn merge(existing: ListingTable, incoming: Vec<ListingRecord>, key: DedupKey) -> ListingTable {
    let mut rows = existing.rows;
    rows.extend(incoming);

    let mut seen = HashSet::with_capacity(rows.len());
    let mut kept: Vec<ListingRecord> = rows
        .into_iter()
        .rev()
        .filter(|r| seen.insert(key.of(r)))
        .collect();
    kept.reverse();

    ListingTable { rows: kept }
}

/// Exclusive hold on a table file for one read-modify-write cycle.
///
/// Backed by a `<table>.lock` file holding the owner's pid, created with
/// create-new semantics and removed on drop. A lock left by a process that
/// no longer exists is taken over.
#[derive(Debug)]
pub struct TableLock {
    path: PathBuf,
}

impl TableLock {
    pub fn acquire(table: &Path) -> Result<Self, PipelineError> {
        let path = lock_path(table);
        match Self::create(&path) {
            Err(PipelineError::TableLocked { owner: Some(pid), .. }) if !process_alive(pid) => {
                warn!(lock = %path.display(), pid, "removing lock left by a dead run");
                fs::remove_file(&path).map_err(|e| PipelineError::StorageWrite {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                Self::create(&path)
            }
            other => other,
        }
    }

    fn create(path: &Path) -> Result<Self, PipelineError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id()).map_err(|e| PipelineError::StorageWrite {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PipelineError::TableLocked {
                lock: path.to_path_buf(),
                owner: fs::read_to_string(path).ok().and_then(|s| s.trim().parse().ok()),
            }),
            Err(e) => Err(PipelineError::StorageWrite {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// No portable liveness check; such locks need removing by hand.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for TableLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(table: &Path) -> PathBuf {
    let mut name = table.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Lock, load, merge and save one table file.
pub fn merge_into_file(
    path: &Path,
    incoming: Vec<ListingRecord>,
    key: DedupKey,
) -> Result<(ListingTable, MergeSummary), PipelineError> {
    let _lock = TableLock::acquire(path)?;

    let existing = ListingTable::load(path)?;
    let previous = existing.len();
    let incoming_len = incoming.len();

    let merged = merge(existing, incoming, key);
    merged.save(path)?;

    let summary = MergeSummary {
        previous,
        incoming: incoming_len,
        merged: merged.len(),
    };
    info!(
        path = %path.display(),
        previous = summary.previous,
        incoming = summary.incoming,
        merged = summary.merged,
        "merged table"
    );
    Ok((merged, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn rec(lat: f64, lon: f64, price: i64) -> ListingRecord {
        let ts = Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap();
        ListingRecord::new(lat, lon, price, 1000.0, ts)
    }

    #[test]
    fn test_merge_new_overrides_stored() {
        let existing = ListingTable::new(vec![rec(40.01, -105.01, 100), rec(40.02, -105.02, 150)]);
        let merged = merge(existing, vec![rec(40.01, -105.01, 200)], DedupKey::Exact);

        assert_eq!(merged.len(), 2);
        let hits: Vec<_> = merged
            .rows
            .iter()
            .filter(|r| r.latitude == 40.01 && r.longitude == -105.01)
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].price, 200);
        // Last-occurrence order: the untouched row now comes first.
        assert_eq!(merged.rows[0].price, 150);
    }

    #[test]
    fn test_merge_into_empty_dedupes_incoming() {
        let merged = merge(
            ListingTable::default(),
            vec![rec(40.0, -105.0, 1), rec(40.1, -105.1, 2), rec(40.0, -105.0, 3)],
            DedupKey::Exact,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.rows[0].price, 2);
        assert_eq!(merged.rows[1].price, 3);
    }

    #[test]
    fn test_exact_key_treats_signed_zero_equal() {
        let merged = merge(
            ListingTable::new(vec![rec(0.0, -105.0, 1)]),
            vec![rec(-0.0, -105.0, 2)],
            DedupKey::Exact,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.rows[0].price, 2);
    }

    #[test]
    fn test_exact_vs_rounded_key() {
        let rows = vec![rec(40.01001, -105.01002, 1)];
        let jitter = vec![rec(40.01004, -105.01003, 2)];

        let exact = merge(ListingTable::new(rows.clone()), jitter.clone(), DedupKey::Exact);
        assert_eq!(exact.len(), 2);

        let rounded = merge(ListingTable::new(rows), jitter, DedupKey::Rounded { decimals: 4 });
        assert_eq!(rounded.len(), 1);
        assert_eq!(rounded.rows[0].price, 2);
    }

    #[test]
    fn test_dedup_key_parse() {
        assert_eq!("exact".parse::<DedupKey>().unwrap(), DedupKey::Exact);
        assert_eq!("rounded".parse::<DedupKey>().unwrap(), DedupKey::Rounded { decimals: 2 });
        assert_eq!("rounded:5".parse::<DedupKey>().unwrap(), DedupKey::Rounded { decimals: 5 });
        assert!("rounded:x".parse::<DedupKey>().is_err());
        assert!("fuzzy".parse::<DedupKey>().is_err());
        assert_eq!(DedupKey::Rounded { decimals: 3 }.to_string(), "rounded:3");
        assert_eq!("rounded:12".parse::<DedupKey>().unwrap(), DedupKey::Rounded { decimals: 12 });
        assert!("rounded:13".parse::<DedupKey>().is_err());
        assert!("rounded:18".parse::<DedupKey>().is_err());
    }

    #[test]
    fn test_fine_rounding_keeps_distinct_locations() {
        let rows = vec![rec(39.70, -104.90, 1), rec(40.50, -105.80, 2), rec(41.00, -103.00, 3)];
        let merged = merge(ListingTable::default(), rows.clone(), DedupKey::Rounded { decimals: 12 });
        assert_eq!(merged.len(), 3);

        // Out-of-range decimals built directly still never collapse rows.
        let merged = merge(ListingTable::default(), rows, DedupKey::Rounded { decimals: 18 });
        assert_eq!(merged.len(), 3);

        let near = vec![rec(39.70, -104.90, 1), rec(39.70, -105.80, 2)];
        let merged = merge(ListingTable::default(), near, DedupKey::Rounded { decimals: 12 });
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_load_missing_and_blank_files() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.csv");
        assert!(ListingTable::load(&missing).unwrap().is_empty());

        let blank = tmp.path().join("blank.csv");
        fs::write(&blank, "\n").unwrap();
        assert!(ListingTable::load(&blank).unwrap().is_empty());
    }

    #[test]
    fn test_load_malformed_file_is_read_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.csv");
        fs::write(&path, "latitude,longitude,price,area\nabc,-105,1,2\n").unwrap();
        assert!(matches!(
            ListingTable::load(&path),
            Err(PipelineError::StorageRead { .. })
        ));
    }

    #[test]
    fn test_save_load_roundtrip_is_lossless() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("denver_sale.csv");
        let mut zero_area = rec(39.123456789012, -104.987654321098, 415_000);
        zero_area.area = 0.0;
        zero_area.price_per_area = None;
        let table = ListingTable::new(vec![
            rec(39.7392358, -104.990251, 450_000),
            rec(0.1 + 0.2, -104.1, 9_999_999_999),
            zero_area,
        ]);

        table.save(&path).unwrap();
        let loaded = ListingTable::load(&path).unwrap();
        assert_eq!(loaded, table);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("latitude,longitude,price,area,price_per_area,time_run\n"));
    }

    #[test]
    fn test_save_empty_table_writes_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.csv");
        ListingTable::default().save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(ListingTable::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");
        ListingTable::new(vec![rec(40.0, -105.0, 1)]).save(&path).unwrap();
        ListingTable::new(vec![rec(40.0, -105.0, 2)]).save(&path).unwrap();

        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(ListingTable::load(&path).unwrap().rows[0].price, 2);
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_rows_reports_writer_failure() {
        let table = ListingTable::new(vec![rec(40.0, -105.0, 1)]);
        assert!(table.write_rows(FullDisk).is_err());

        let mut buf = Vec::new();
        table.write_rows(&mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("latitude,"));
    }

    #[test]
    fn test_failed_save_keeps_previous_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");
        let previous = ListingTable::new(vec![rec(40.0, -105.0, 1), rec(40.1, -105.1, 2)]);
        previous.save(&path).unwrap();

        let replacement = ListingTable::new(vec![rec(41.0, -106.0, 3)]);
        let result = replace_file(&path, |file| {
            replacement.write_rows(&mut *file)?;
            Err(csv::Error::from(std::io::Error::new(ErrorKind::Other, "disk full")))
        });
        assert!(matches!(result, Err(PipelineError::StorageWrite { .. })));

        assert_eq!(ListingTable::load(&path).unwrap(), previous);
        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_save_into_missing_dir_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("no_such_dir").join("t.csv");
        assert!(matches!(
            ListingTable::default().save(&path),
            Err(PipelineError::StorageWrite { .. })
        ));
    }

    #[test]
    fn test_load_legacy_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("legacy.csv");
        fs::write(&path, "latitude,longitude,price,area,p/a\n40.0,-105.0,100,50.0,2.0\n").unwrap();

        let table = ListingTable::load(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].price_per_area, Some(2.0));
        assert_eq!(table.rows[0].observed_at, None);
    }

    #[test]
    fn test_load_naive_time_run_then_resave() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Denver_sale.csv");
        fs::write(
            &path,
            "latitude,longitude,price,area,p/a,time_run\n\
             39.7392,-104.9903,450000,1800.0,250.0,2021-03-04 17:22:09.123456\n",
        )
        .unwrap();

        let table = ListingTable::load(&path).unwrap();
        let ts = table.rows[0].observed_at.unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(), "2021-03-04 17:22:09.123456");

        table.save(&path).unwrap();
        assert_eq!(ListingTable::load(&path).unwrap(), table);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");

        let lock = TableLock::acquire(&path).unwrap();
        match TableLock::acquire(&path) {
            Err(PipelineError::TableLocked { lock, owner }) => {
                assert_eq!(lock, tmp.path().join("t.csv.lock"));
                assert_eq!(owner, Some(std::process::id()));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            merge_into_file(&path, vec![rec(40.0, -105.0, 1)], DedupKey::Exact),
            Err(PipelineError::TableLocked { .. })
        ));
        assert!(!path.exists());

        drop(lock);
        assert!(TableLock::acquire(&path).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_from_dead_process_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");
        // Above the kernel's pid_max, so never a live process.
        fs::write(lock_path(&path), "999999999\n").unwrap();

        let lock = TableLock::acquire(&path).unwrap();
        let owner = fs::read_to_string(lock_path(&path)).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
        drop(lock);
        assert!(!lock_path(&path).exists());
    }

    #[test]
    fn test_unreadable_lock_owner_stays_locked() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");
        fs::write(lock_path(&path), "").unwrap();

        let err = TableLock::acquire(&path).unwrap_err();
        assert!(matches!(err, PipelineError::TableLocked { owner: None, .. }));
        assert!(err.to_string().contains("t.csv.lock"));
    }

    #[test]
    fn test_merge_into_file_twice() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("denver_sold.csv");

        let (_, first) = merge_into_file(
            &path,
            vec![rec(40.01, -105.01, 100), rec(40.02, -105.02, 300)],
            DedupKey::Exact,
        )
        .unwrap();
        assert_eq!(first, MergeSummary { previous: 0, incoming: 2, merged: 2 });

        let (table, second) =
            merge_into_file(&path, vec![rec(40.01, -105.01, 200)], DedupKey::Exact).unwrap();
        assert_eq!(second, MergeSummary { previous: 2, incoming: 1, merged: 2 });
        assert_eq!(ListingTable::load(&path).unwrap(), table);
        assert!(!lock_path(&path).exists());
    }
}
