//! Crash-safe JSON / JSONL writes.
//!
//! Every persistent record in the core goes through these helpers: write to
//! a uniquely named sibling temp file, fsync, rename into place. Rename is
//! the atomic commit point, so concurrent readers observe either the old
//! bytes or the new bytes, never a partial write.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

fn tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}.tmp", file_name, Uuid::new_v4().simple()))
}

fn commit(tmp: &Path, path: &Path) -> Result<()> {
    let result = fs::rename(tmp, path)
        .with_context(|| format!("atomic rename failed: {}", path.display()));
    if result.is_err() {
        let _ = fs::remove_file(tmp);
    }
    result
}

/// Write `value` as pretty JSON, atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let write = || -> Result<()> {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    commit(&tmp, path)
}

/// Write records as JSON lines, atomically.
pub fn atomic_write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let write = || -> Result<()> {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    commit(&tmp, path)
}

/// Read a JSON file, returning `None` when it is missing or unreadable.
///
/// For records where a corrupt file should not take the caller down (index
/// files, debounce state); anything load-bearing parses explicitly instead.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        let record = Record {
            name: "lane".to_string(),
            count: 3,
        };

        atomic_write_json(&path, &record).unwrap();
        let loaded: Record = read_json_opt(&path).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_overwrite_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");

        let mut big = BTreeMap::new();
        for i in 0..100 {
            big.insert(format!("key-{i}"), "x".repeat(100));
        }
        atomic_write_json(&path, &big).unwrap();

        let small: BTreeMap<String, String> = BTreeMap::new();
        atomic_write_json(&path, &small).unwrap();

        let loaded: BTreeMap<String, String> = read_json_opt(&path).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        atomic_write_json(&path, &Record {
            name: "a".to_string(),
            count: 1,
        })
        .unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let records = vec![
            Record {
                name: "a".to_string(),
                count: 1,
            },
            Record {
                name: "b".to_string(),
                count: 2,
            },
        ];
        atomic_write_jsonl(&path, &records).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Record = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.name, "a");
    }

    #[test]
    fn test_read_json_opt_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(read_json_opt::<Record>(&missing).is_none());

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, "{not json").unwrap();
        assert!(read_json_opt::<Record>(&corrupt).is_none());
    }
}
