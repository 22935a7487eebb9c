//! Append-only record of position transitions.
//!
//! Audit only: nothing reads it back on startup, so a restart still loses
//! level, average price and fees even when the venue holds a position.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::position::Direction;

#[derive(Debug)]
pub struct Journal {
    file: File,
    path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum JournalEntry {
    #[serde(rename = "seed")]
    Seed {
        ts: u64,
        direction: Direction,
        qty: f64,
        price: f64,
        leg_notional: f64,
    },
    #[serde(rename = "add")]
    Add {
        ts: u64,
        level: i32,
        qty: f64,
        price: f64,
        avg_price: f64,
        used_notional: f64,
    },
    #[serde(rename = "close")]
    Close {
        ts: u64,
        reason: String,
        direction: Direction,
        qty: f64,
        price: f64,
    },
    #[serde(rename = "external_close")]
    ExternalClose {
        ts: u64,
        direction: Direction,
        qty: f64,
    },
    #[serde(rename = "take_profit")]
    TakeProfit {
        ts: u64,
        order_id: String,
        price: f64,
        qty: f64,
    },
}

impl Journal {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file, path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn append(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }

    /// Parse a journal back; unreadable lines are skipped.
    pub fn read_entries(path: &str) -> std::io::Result<Vec<JournalEntry>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let path = path.to_str().unwrap();

        let mut j = Journal::open(path).unwrap();
        j.append(&JournalEntry::Seed {
            ts: 1,
            direction: Direction::Long,
            qty: 10.0,
            price: 1.0,
            leg_notional: 10.0,
        })
        .unwrap();
        j.append(&JournalEntry::Close {
            ts: 2,
            reason: "emergency_stop".into(),
            direction: Direction::Long,
            qty: 10.0,
            price: 0.9,
        })
        .unwrap();

        let entries = Journal::read_entries(path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], JournalEntry::Seed { direction: Direction::Long, .. }));
        assert!(matches!(&entries[1], JournalEntry::Close { reason, .. } if reason == "emergency_stop"));
    }

    #[test]
    fn test_lines_are_tagged_by_operation() {
        let line = serde_json::to_string(&JournalEntry::ExternalClose {
            ts: 5,
            direction: Direction::Short,
            qty: 3.0,
        })
        .unwrap();
        assert!(line.contains("\"operation\":\"external_close\""));
        assert!(line.contains("\"direction\":\"short\""));
    }

    #[test]
    fn test_missing_journal_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.jsonl");
        assert!(Journal::read_entries(path.to_str().unwrap()).unwrap().is_empty());
    }
}
