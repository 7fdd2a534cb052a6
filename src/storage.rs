use crate::config::{read_config, write_config, AppPaths, UsageConfig};
use crate::error::AppError;
use crate::models::UsageEntry;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Split, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// Append-only JSONL usage log plus the config file next to it.
///
/// Holds no locks of its own; `UsageTracker` serializes writers.
pub struct Storage {
    log_path: PathBuf,
    config_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retained {
    pub kept: usize,
    pub removed: usize,
}

impl Storage {
    pub fn open(paths: &AppPaths) -> Result<Self, AppError> {
        Self::with_paths(&paths.usage_log, &paths.config_file)
    }

    pub fn with_paths(log_path: &Path, config_path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !log_path.exists() {
            File::create(log_path)?;
        }
        Ok(Self {
            log_path: log_path.to_path_buf(),
            config_path: config_path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Writes one entry as a single line with a single `write_all`.
    pub fn append(&self, entry: &UsageEntry) -> Result<(), AppError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Lazily decodes the log from the start, oldest entry first.
    pub fn scan(&self) -> Result<EntryIter, AppError> {
        let lines = match File::open(&self.log_path) {
            Ok(file) => Some(BufReader::new(file).split(b'\n')),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(EntryIter { lines, line_no: 0 })
    }

    /// Rewrites the log keeping entries stamped at or after `cutoff`.
    ///
    /// Lines that cannot be decoded are carried over untouched. The new log is
    /// written to a sibling temp file and renamed over the old one.
    pub fn retain_since(&self, cutoff: DateTime<Utc>) -> Result<Retained, AppError> {
        let mut kept_lines = Vec::new();
        let mut stats = Retained::default();

        for (idx, line) in self.raw_lines()?.enumerate() {
            let line = line?;
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice::<UsageEntry>(&line) {
                Ok(entry) if entry.timestamp < cutoff => stats.removed += 1,
                Ok(_) => {
                    stats.kept += 1;
                    kept_lines.push(line);
                }
                Err(e) => {
                    warn!(line = idx + 1, error = %e, "keeping undecodable usage line during cleanup");
                    kept_lines.push(line);
                }
            }
        }

        let dir = self
            .log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        for line in &kept_lines {
            tmp.write_all(line)?;
            tmp.write_all(b"\n")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.log_path)?;

        Ok(stats)
    }

    /// Raw line bytes. Nothing is decoded here, so bad UTF-8 survives a rewrite.
    fn raw_lines(&self) -> Result<Box<dyn Iterator<Item = std::io::Result<Vec<u8>>>>, AppError> {
        match File::open(&self.log_path) {
            Ok(file) => Ok(Box::new(BufReader::new(file).split(b'\n'))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads the config, writing defaults on first run.
    pub fn load_config(&self) -> Result<UsageConfig, AppError> {
        match read_config(&self.config_path)? {
            Some(cfg) => Ok(cfg),
            None => {
                let cfg = UsageConfig::default();
                write_config(&self.config_path, &cfg)?;
                Ok(cfg)
            }
        }
    }

    pub fn save_config(&self, config: &UsageConfig) -> Result<(), AppError> {
        write_config(&self.config_path, config)
    }
}

pub struct EntryIter {
    lines: Option<Split<BufReader<File>>>,
    line_no: usize,
}

impl Iterator for EntryIter {
    type Item = Result<UsageEntry, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            let line = match String::from_utf8(line) {
                Ok(line) => line,
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "skipping usage line with invalid UTF-8");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageEntry>(&line) {
                Ok(entry) => return Some(Ok(entry)),
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "skipping malformed usage entry");
                }
            }
        }
    }
}
