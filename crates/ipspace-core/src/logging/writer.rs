//! Append-only JSONL file per profile and day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogEntry;

/// Appends [`LogEntry`] lines to `<logs_dir>/raw/<date>_<profile>.jsonl`.
pub struct ProfileLogWriter {
    profile: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ProfileLogWriter {
    /// Open (or create) today's file for `profile`.
    pub fn new(logs_dir: impl AsRef<Path>, profile: impl Into<String>) -> std::io::Result<Self> {
        let profile = profile.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, profile));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            profile,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    /// Profile name written into every entry.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush.
    pub fn write(&self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()
    }
}

impl Drop for ProfileLogWriter {
    fn drop(&mut self) {
        let _ = self.writer.lock().flush();
    }
}

/// Read every entry under `<logs_dir>/raw`, sorted by timestamp.
///
/// Lines that do not parse are skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dirent in fs::read_dir(&raw_dir)? {
        let path = dirent?.path();
        if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
            let content = fs::read_to_string(&path)?;
            entries.extend(
                content
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok()),
            );
        }
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_layout() {
        let temp = TempDir::new().unwrap();
        let writer = ProfileLogWriter::new(temp.path().join("logs"), "alice").unwrap();

        assert!(temp.path().join("logs/raw").exists());
        assert!(writer.path().to_string_lossy().ends_with("_alice.jsonl"));
    }

    #[test]
    fn test_two_profiles_read_back() {
        let temp = TempDir::new().unwrap();
        let logs = temp.path().join("logs");

        let alice = ProfileLogWriter::new(&logs, "alice").unwrap();
        let bob = ProfileLogWriter::new(&logs, "bob").unwrap();
        alice
            .write(&LogEntry::new("info", "alice", "t", "Alice up"))
            .unwrap();
        bob.write(&LogEntry::new("warn", "bob", "t", "Bob degraded"))
            .unwrap();
        drop(alice);
        drop(bob);

        // A stray line must not break reading
        let stray = logs.join("raw").join("junk.jsonl");
        fs::write(&stray, "not json\n").unwrap();

        let entries = read_entries(&logs).unwrap();
        assert_eq!(entries.len(), 2);
        let profiles: Vec<_> = entries.iter().map(|e| e.profile.as_str()).collect();
        assert!(profiles.contains(&"alice"));
        assert!(profiles.contains(&"bob"));
    }
}
