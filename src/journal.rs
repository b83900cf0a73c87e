//! Session journal.
//!
//! Operator-facing record of graduation sessions: when each session started
//! and ended, every captured point, pauses and checkpoint decisions. The
//! newest entries stay in memory for the front end; a journal opened with a
//! log directory also appends every entry to a file.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::controller::{Direction, StrokeMode};
use crate::engine::EngineState;
use crate::settings::GraduatorSettings;
use crate::units::PressureUnit;

/// Entries kept in memory unless configured otherwise.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 500;

/// Journal entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalLevel {
    Info,
    Success,
    Warning,
    Error,
    Checkpoint,
}

impl JournalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalLevel::Info => "INFO",
            JournalLevel::Success => "SUCCESS",
            JournalLevel::Warning => "WARN",
            JournalLevel::Error => "ERROR",
            JournalLevel::Checkpoint => "CHECK",
        }
    }
}

/// A single journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Local>,
    pub level: JournalLevel,
    /// Session the entry belongs to, if one was open.
    pub session: Option<Uuid>,
    pub message: String,
}

impl JournalEntry {
    /// Line shown to the operator.
    pub fn format_display(&self) -> String {
        format!(
            "[{}] {:<7} {}",
            self.timestamp.format("%H:%M:%S"),
            self.level.as_str(),
            self.message
        )
    }

    fn format_file(&self) -> String {
        let session = self
            .session
            .map(|id| id.simple().to_string()[..8].to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "[{}] [{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level.as_str(),
            session,
            self.message
        )
    }
}

/// Bounded journal of graduation sessions with an optional backing file.
#[derive(Debug, Clone)]
pub struct SessionJournal {
    entries: VecDeque<JournalEntry>,
    capacity: usize,
    session: Option<Uuid>,
    log_file: Option<PathBuf>,
}

impl Default for SessionJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionJournal {
    /// Journal kept in memory only.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: DEFAULT_JOURNAL_CAPACITY,
            session: None,
            log_file: None,
        }
    }

    /// Journal that also appends to a new file in `dir`.
    pub fn with_log_dir(dir: &Path) -> Self {
        let mut journal = Self::new();
        journal.log_file = Self::create_log_file(dir);
        journal
    }

    /// Journal writing to the application logs directory.
    pub fn persistent() -> Self {
        GraduatorSettings::logs_dir()
            .map(|dir| Self::with_log_dir(&dir))
            .unwrap_or_default()
    }

    /// Keep at most `capacity` entries in memory. The file keeps everything.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self
    }

    fn create_log_file(dir: &Path) -> Option<PathBuf> {
        let path = dir.join(format!(
            "graduation_{}.log",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        match fs::create_dir_all(dir).and_then(|_| File::create(&path)) {
            Ok(_) => Some(path),
            Err(e) => {
                warn!("Journal file {} unavailable: {}", path.display(), e);
                None
            }
        }
    }

    /// Open a session: later entries are tagged with `id`.
    pub fn session_started(
        &mut self,
        id: Uuid,
        model: &str,
        unit: PressureUnit,
        mode: StrokeMode,
        points: usize,
    ) {
        self.session = Some(id);
        self.info(format!(
            "Graduation of '{}' started: {} points, {:?}, {}",
            model, points, mode, unit
        ));
    }

    pub fn point_captured(
        &mut self,
        index: usize,
        planned: usize,
        direction: Direction,
        pressure: f64,
        unit: PressureUnit,
        angle: f64,
    ) {
        self.info(format!(
            "Point {}/{} {}: {:.3} {} -> {:.2} deg",
            index, planned, direction, pressure, unit, angle
        ));
    }

    /// Close the session with its final outcome.
    pub fn session_ended(&mut self, outcome: EngineState, detail: &str) {
        let level = match outcome {
            EngineState::Complete => JournalLevel::Success,
            EngineState::Faulted => JournalLevel::Error,
            _ => JournalLevel::Warning,
        };
        let message = if detail.is_empty() {
            format!("Graduation {}", outcome)
        } else {
            format!("Graduation {}: {}", outcome, detail)
        };
        self.log(level, message);
        self.session = None;
    }

    /// Add an entry.
    pub fn log(&mut self, level: JournalLevel, message: impl Into<String>) {
        let entry = JournalEntry {
            timestamp: Local::now(),
            level,
            session: self.session,
            message: message.into(),
        };
        self.append_to_file(&entry);

        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    fn append_to_file(&mut self, entry: &JournalEntry) {
        let Some(path) = &self.log_file else {
            return;
        };
        let written = OpenOptions::new()
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", entry.format_file()));
        if let Err(e) = written {
            warn!(
                "Journal file {} not writable, keeping entries in memory: {}",
                path.display(),
                e
            );
            self.log_file = None;
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(JournalLevel::Info, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.log(JournalLevel::Warning, message);
    }

    pub fn checkpoint(&mut self, message: impl Into<String>) {
        self.log(JournalLevel::Checkpoint, message);
    }

    /// Entries in memory, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    /// Entries of one session still in memory.
    pub fn session_entries(&self, id: Uuid) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter().filter(move |e| e.session == Some(id))
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_drops_oldest() {
        let mut journal = SessionJournal::new().with_capacity(2);
        journal.info("one");
        journal.warning("two");
        journal.checkpoint("three");
        let messages: Vec<&str> = journal.entries().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["two", "three"]);
    }

    #[test]
    fn test_entries_tagged_with_session() {
        let mut journal = SessionJournal::new();
        let id = Uuid::new_v4();
        journal.info("before");
        journal.session_started(id, "MP-15", PressureUnit::Kgf, StrokeMode::ForwardOnly, 3);
        journal.point_captured(1, 3, Direction::Forward, 5.0, PressureUnit::Kgf, 45.0);
        journal.session_ended(EngineState::Complete, "3 points");
        journal.info("after");

        let tagged: Vec<&JournalEntry> = journal.session_entries(id).collect();
        assert_eq!(tagged.len(), 3);
        assert!(tagged[1].message.contains("Point 1/3 forward"));
        assert_eq!(tagged[2].level, JournalLevel::Success);
        assert!(journal.entries().last().unwrap().session.is_none());
    }

    #[test]
    fn test_writes_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut journal = SessionJournal::with_log_dir(dir.path());
        let id = Uuid::new_v4();
        journal.session_started(id, "MP-15", PressureUnit::Kgf, StrokeMode::ForwardOnly, 3);
        journal.session_ended(EngineState::Faulted, "preload exceeded");

        let path = journal.log_file_path().unwrap().to_path_buf();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(&id.simple().to_string()[..8]));
        assert!(lines[1].contains("[ERROR]"));
        assert!(lines[1].contains("Graduation faulted: preload exceeded"));
    }

    #[test]
    fn test_unwritable_file_falls_back_to_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut journal = SessionJournal::with_log_dir(dir.path());
        let path = journal.log_file_path().unwrap().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        journal.warning("still recorded");
        assert!(journal.log_file_path().is_none());
        assert_eq!(journal.entries().count(), 1);
    }
}
