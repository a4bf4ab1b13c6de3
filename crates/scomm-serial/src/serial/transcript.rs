//! Transcript sink: the bounded, line-tagged log shown to the user.
//!
//! Mutated only by the presentation loop as it drains queued updates.
//! Old lines are evicted once `max_lines` is exceeded. The whole buffer
//! can be exported as plain UTF-8 text.

use crate::serial::types::*;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default retention, in entries.
pub const DEFAULT_MAX_LINES: usize = 5000;

/// What [`TranscriptSink::apply`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Appended,
    Replaced,
}

#[derive(Debug)]
pub struct TranscriptSink {
    entries: VecDeque<TranscriptEntry>,
    max_lines: usize,
    evicted: u64,
}

impl Default for TranscriptSink {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl TranscriptSink {
    pub fn new(max_lines: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_lines: max_lines.max(1),
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.back()
    }

    /// Apply one update. A replacement whose target was already evicted
    /// (or never seen) is appended instead.
    pub fn apply(&mut self, update: TranscriptUpdate) -> Applied {
        match update {
            TranscriptUpdate::Append(entry) => {
                self.push(entry);
                Applied::Appended
            }
            TranscriptUpdate::ReplaceTail(entry) => {
                // The target is almost always the last entry.
                match self.entries.iter_mut().rev().find(|e| e.id == entry.id) {
                    Some(slot) => {
                        *slot = entry;
                        Applied::Replaced
                    }
                    None => {
                        self.push(entry);
                        Applied::Appended
                    }
                }
            }
        }
    }

    fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.max_lines {
            self.entries.pop_front();
            self.evicted += 1;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The buffer as text, one formatted entry per line.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.format_line());
            out.push('\n');
        }
        out
    }

    /// Write the buffer to `path`, replacing any existing file.
    pub fn export(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(self.render_text().as_bytes())?;
        file.flush()?;
        log::info!("Exported {} transcript lines to {}", self.len(), path.display());
        Ok(())
    }

    /// Export into `dir` under the default file name.
    pub fn export_default(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(default_export_name(chrono::Utc::now().timestamp_millis()));
        self.export(&path)?;
        Ok(path)
    }
}

/// `scommlog-<epoch-ms>.txt`
pub fn default_export_name(epoch_ms: i64) -> String {
    format!("scommlog-{}.txt", epoch_ms)
}
