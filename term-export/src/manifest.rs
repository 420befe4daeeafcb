//! Run manifest: one `<encrypted_file_name>|<row_count>` line per file.
//!
//! Entries are added as shards finish, possibly from concurrent tasks, so the
//! builder is a cheaply cloneable handle over shared state. Rendering sorts
//! by file name, which makes the manifest independent of completion order.

use std::io::BufRead;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// One encrypted file and the data rows of its plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_name: String,
    pub row_count: u64,
}

impl ManifestEntry {
    /// Parses a `name|rows` line.
    pub fn parse(line: &str) -> Result<Self> {
        let (name, rows) = line
            .rsplit_once('|')
            .ok_or_else(|| ExportError::Manifest(format!("malformed manifest line '{line}'")))?;
        let row_count = rows
            .trim()
            .parse()
            .map_err(|e| ExportError::Manifest(format!("bad row count in '{line}': {e}")))?;
        Ok(Self {
            file_name: name.to_string(),
            row_count,
        })
    }
}

/// `<prefix>_<YYYYMMDD>_<HHMMSS>.tag`
pub fn manifest_file_name(prefix: &str, timestamp: DateTime<Utc>) -> String {
    format!("{prefix}_{}.tag", timestamp.format("%Y%m%d_%H%M%S"))
}

/// Accumulates manifest entries for one run.
#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder {
    entries: Arc<Mutex<Vec<ManifestEntry>>>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, file_name: impl Into<String>, row_count: u64) -> Result<()> {
        let file_name = file_name.into();
        if file_name.contains(['|', '\n', '\r']) {
            return Err(ExportError::Manifest(format!(
                "file name '{file_name}' cannot appear in a manifest"
            )));
        }
        self.lock()?.push(ManifestEntry {
            file_name,
            row_count,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries sorted by file name.
    pub fn entries(&self) -> Result<Vec<ManifestEntry>> {
        let mut entries = self.lock()?.clone();
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(entries)
    }

    /// Sum of all entry row counts.
    pub fn total_rows(&self) -> u64 {
        self.lock()
            .map(|e| e.iter().map(|entry| entry.row_count).sum())
            .unwrap_or(0)
    }

    /// Newline-joined manifest text, or `None` when there are no entries.
    pub fn render(&self) -> Result<Option<String>> {
        let entries = self.entries()?;
        if entries.is_empty() {
            return Ok(None);
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|e| format!("{}|{}", e.file_name, e.row_count))
            .collect();
        Ok(Some(lines.join("\n")))
    }

    /// Parses manifest text back into entries.
    pub fn parse(text: &str) -> Result<Vec<ManifestEntry>> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(ManifestEntry::parse)
            .collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ManifestEntry>>> {
        self.entries
            .lock()
            .map_err(|_| ExportError::Manifest("manifest state poisoned".to_string()))
    }
}

/// Counts the data rows of a delimited-text file, excluding the header.
///
/// Quoted fields may contain newlines; a record ends at a newline outside
/// quotes. A missing final newline still ends the last record.
pub fn count_data_rows(path: &Path, has_header: bool) -> Result<u64> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut records: u64 = 0;
    let mut in_quotes = false;
    let mut pending = false;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        for byte in &buf {
            match byte {
                b'"' => {
                    in_quotes = !in_quotes;
                    pending = true;
                }
                b'\n' if !in_quotes => {
                    records += 1;
                    pending = false;
                }
                b'\r' => {}
                _ => pending = true,
            }
        }
    }
    if pending {
        records += 1;
    }

    Ok(if has_header {
        records.saturating_sub(1)
    } else {
        records
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_is_sorted_and_parseable() {
        let builder = ManifestBuilder::new();
        assert_eq!(builder.render().unwrap(), None);

        let handle = builder.clone();
        handle.add("t_20240101_000000_002.csv.pgp", 5).unwrap();
        builder.add("t_20240101_000000_000.csv.pgp", 0).unwrap();
        builder.add("t_20240101_000000_001.csv.pgp", 12).unwrap();

        let text = builder.render().unwrap().unwrap();
        assert_eq!(
            text,
            "t_20240101_000000_000.csv.pgp|0\nt_20240101_000000_001.csv.pgp|12\nt_20240101_000000_002.csv.pgp|5"
        );
        assert_eq!(ManifestBuilder::parse(&text).unwrap(), builder.entries().unwrap());
        assert_eq!(builder.total_rows(), 17);
        assert!(builder.add("bad|name", 1).is_err());
    }

    #[test]
    fn test_manifest_file_name() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).unwrap();
        assert_eq!(manifest_file_name("orders", ts), "orders_20241231_235958.tag");
    }

    #[test]
    fn test_count_data_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cases: [(&str, bool, u64); 6] = [
            ("a,b\n1,2\n3,4\n", true, 2),
            ("a,b\n", true, 0),
            ("", true, 0),
            ("1,2\n3,4", false, 2),
            ("a,b\n\"multi\nline\",2\n3,4\n", true, 2),
            ("a,b\r\n1,2\r\n", true, 1),
        ];
        for (i, (text, header, expected)) in cases.into_iter().enumerate() {
            let path = dir.path().join(format!("{i}.csv"));
            std::fs::write(&path, text).unwrap();
            assert_eq!(count_data_rows(&path, header).unwrap(), expected, "{text:?}");
        }
    }
}
