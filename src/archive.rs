//! Numbered archive of finished graduations.
//!
//! Every completed session is saved as a numbered party of the stand:
//!
//! ```text
//! <root>/stand<N>/<dd.mm.yyyy>/p<party>/table.json    graduation table
//!                                      /scale.tbl     scale printer input
//!                                      /record.json   summary, see ResultRecord
//! ```
//!
//! Party numbers restart at 1 every day and continue after the highest
//! party already on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::controller::{Direction, StrokeMode};
use crate::engine::{ArchivedSession, EngineState};
use crate::table::TableError;
use crate::units::PressureUnit;

pub const TABLE_FILE: &str = "table.json";
pub const SCALE_FILE: &str = "scale.tbl";
pub const RECORD_FILE: &str = "record.json";

/// Header line expected by the scale printer.
const SCALE_HEADER: &str = "       320       240       230";

static PARTY_DIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^p(\d+)$").expect("party directory pattern is valid"));

/// Archive errors.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Only complete sessions are archived, this one is {0}")]
    NotComplete(EngineState),
    #[error("Table has no accepted forward points")]
    NothingToSave,
    #[error("Failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Invalid record {path}: {source}")]
    Record {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Table error: {0}")]
    Table(#[from] TableError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError {
    let path = path.to_path_buf();
    move |source| ArchiveError::Io { path, source }
}

/// Summary of one archived party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub party: u32,
    pub session: Uuid,
    pub model: String,
    pub unit: PressureUnit,
    pub mode: StrokeMode,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration_s: f64,
    pub points: usize,
    pub rejected: usize,
    pub passed: bool,
    pub max_abs_deviation: f64,
    pub allowance: f64,
    pub max_hysteresis: f64,
    pub telemetry_dir: Option<PathBuf>,
    /// Party directory.
    pub dir: PathBuf,
}

/// Result archive of one stand.
#[derive(Debug, Clone)]
pub struct ResultArchive {
    root: PathBuf,
    stand: u32,
}

impl ResultArchive {
    pub fn new(root: impl Into<PathBuf>, stand: u32) -> Self {
        Self {
            root: root.into(),
            stand,
        }
    }

    fn stand_dir(&self) -> PathBuf {
        self.root.join(format!("stand{}", self.stand))
    }

    /// Directory holding the parties of `date`.
    pub fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.stand_dir().join(date.format("%d.%m.%Y").to_string())
    }

    /// Number the next party of `date` would get.
    pub fn next_party(&self, date: NaiveDate) -> Result<u32, ArchiveError> {
        let dir = self.day_dir(date);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(io_error(&dir)(e)),
        };
        let highest = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| party_number(&e.file_name().to_string_lossy()))
            .max()
            .unwrap_or(0);
        Ok(highest + 1)
    }

    /// Save a completed session as the next party of its finishing day.
    pub fn save(&self, session: &ArchivedSession) -> Result<ResultRecord, ArchiveError> {
        if session.outcome != EngineState::Complete {
            return Err(ArchiveError::NotComplete(session.outcome));
        }
        let table = &session.table;
        if !table
            .points(Direction::Forward)
            .iter()
            .any(|p| p.accepted)
        {
            return Err(ArchiveError::NothingToSave);
        }

        let day = self.day_dir(session.finished_at.date_naive());
        fs::create_dir_all(&day).map_err(io_error(&day))?;
        let mut party = self.next_party(session.finished_at.date_naive())?;
        let dir = loop {
            let dir = day.join(format!("p{}", party));
            match fs::create_dir(&dir) {
                Ok(()) => break dir,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => party += 1,
                Err(e) => return Err(io_error(&dir)(e)),
            }
        };

        let duration = session.finished_at - session.started_at;
        table.save(dir.join(TABLE_FILE))?;
        let scale = dir.join(SCALE_FILE);
        fs::write(&scale, scale_file(session, duration.num_seconds()))
            .map_err(io_error(&scale))?;

        let report = session.report();
        let record = ResultRecord {
            party,
            session: session.id,
            model: session.model.name().to_string(),
            unit: table.unit(),
            mode: table.mode(),
            started_at: session.started_at,
            finished_at: session.finished_at,
            duration_s: duration.num_milliseconds() as f64 / 1000.0,
            points: table.len(),
            rejected: table.all_points().filter(|p| !p.accepted).count(),
            passed: report.passed,
            max_abs_deviation: report.max_abs_deviation,
            allowance: report.allowance,
            max_hysteresis: report.max_hysteresis,
            telemetry_dir: session.telemetry_dir.clone(),
            dir: dir.clone(),
        };
        let path = dir.join(RECORD_FILE);
        let json = serde_json::to_string_pretty(&record).map_err(|source| ArchiveError::Record {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(io_error(&path))?;

        info!(
            "Session {} archived as party {} in {}",
            session.id,
            party,
            dir.display()
        );
        Ok(record)
    }

    /// Every archived party of the stand, oldest first. Unreadable
    /// records are skipped.
    pub fn history(&self) -> Result<Vec<ResultRecord>, ArchiveError> {
        let stand = self.stand_dir();
        let days = match fs::read_dir(&stand) {
            Ok(days) => days,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&stand)(e)),
        };

        let mut records = Vec::new();
        for day in days.filter_map(Result::ok).map(|e| e.path()) {
            let Ok(parties) = fs::read_dir(&day) else {
                continue;
            };
            for party in parties.filter_map(Result::ok) {
                if party_number(&party.file_name().to_string_lossy()).is_none() {
                    continue;
                }
                match read_record(&party.path().join(RECORD_FILE)) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping archived party: {}", e),
                }
            }
        }
        records.sort_by_key(|r| r.finished_at);
        Ok(records)
    }

    /// Record of the party saved for `session`.
    pub fn find(&self, session: Uuid) -> Result<Option<ResultRecord>, ArchiveError> {
        Ok(self.history()?.into_iter().find(|r| r.session == session))
    }
}

fn party_number(name: &str) -> Option<u32> {
    PARTY_DIR
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn read_record(path: &Path) -> Result<ResultRecord, ArchiveError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&content).map_err(|source| ArchiveError::Record {
        path: path.to_path_buf(),
        source,
    })
}

/// Scale printer input: one row per accepted forward point with the
/// pressure and the forward and backward angles in degrees. Forward-only
/// tables repeat the forward angle.
fn scale_file(session: &ArchivedSession, seconds: i64) -> String {
    let table = &session.table;
    let mut out = String::new();
    out.push_str(SCALE_HEADER);
    out.push('\n');
    out.push_str(session.model.name());
    out.push('\n');
    for forward in table.points(Direction::Forward).iter().filter(|p| p.accepted) {
        let backward = table
            .backward_at(forward.target)
            .map(|p| p.angle)
            .unwrap_or(forward.angle);
        for value in [forward.pressure, forward.angle, backward, 0.0, 0.0] {
            out.push(' ');
            out.push_str(&scientific(value));
        }
        out.push('\n');
    }
    let seconds = seconds.max(0);
    out.push_str(&format!(
        "Graduation time: {:02}:{:02} sec.\n",
        seconds / 60,
        seconds % 60
    ));
    out
}

/// `value` with eleven mantissa decimals and a signed two-digit exponent,
/// positive values led by a space: ` 1.50000000000E+01`.
fn scientific(value: f64) -> String {
    let formatted = format!("{:.11E}", value);
    let (mantissa, exponent) = formatted
        .split_once('E')
        .unwrap_or((formatted.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    format!(
        "{}{}E{}{:02}",
        if value.is_sign_negative() { "" } else { " " },
        mantissa,
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GaugeModel, ScalePoint};
    use crate::table::{GraduationPoint, GraduationTable};
    use std::sync::Arc;

    fn session(outcome: EngineState, finished_at: DateTime<Local>) -> ArchivedSession {
        let model = GaugeModel::new(
            "MP-15",
            PressureUnit::Kgf,
            1.5,
            vec![
                ScalePoint::new(5.0, 45.0),
                ScalePoint::new(10.0, 90.0),
                ScalePoint::new(15.0, 135.0),
            ],
        )
        .unwrap();
        let mut table =
            GraduationTable::new("MP-15", PressureUnit::Kgf, StrokeMode::ForwardAndBackward);
        for (target, angle) in [(5.0, 45.0), (10.0, 90.5), (15.0, 135.0)] {
            table
                .add_point(GraduationPoint::new(target, target, angle, Direction::Forward))
                .unwrap();
        }
        for (target, angle) in [(15.0, 135.0), (10.0, 91.0), (5.0, 45.5)] {
            table
                .add_point(GraduationPoint::new(target, target, angle, Direction::Backward))
                .unwrap();
        }
        table.finalize().unwrap();
        ArchivedSession {
            id: Uuid::new_v4(),
            model: Arc::new(model),
            table,
            outcome,
            started_at: finished_at - chrono::Duration::seconds(125),
            finished_at,
            telemetry_dir: None,
        }
    }

    #[test]
    fn test_scientific_matches_printer_format() {
        assert_eq!(scientific(15.0), " 1.50000000000E+01");
        assert_eq!(scientific(-0.25), "-2.50000000000E-01");
        assert_eq!(scientific(0.0), " 0.00000000000E+00");
    }

    #[test]
    fn test_parties_numbered_per_day() {
        let root = tempfile::TempDir::new().unwrap();
        let archive = ResultArchive::new(root.path(), 4);
        let now = Local::now();
        assert_eq!(archive.next_party(now.date_naive()).unwrap(), 1);

        let first = archive.save(&session(EngineState::Complete, now)).unwrap();
        let second = archive.save(&session(EngineState::Complete, now)).unwrap();
        assert_eq!((first.party, second.party), (1, 2));
        assert!(second.dir.ends_with("p2"));
        assert!(second
            .dir
            .starts_with(root.path().join("stand4").join(now.format("%d.%m.%Y").to_string())));

        fs::create_dir(archive.day_dir(now.date_naive()).join("p7")).unwrap();
        fs::create_dir(archive.day_dir(now.date_naive()).join("notes")).unwrap();
        assert_eq!(archive.next_party(now.date_naive()).unwrap(), 8);

        let yesterday = now - chrono::Duration::days(1);
        let other = archive.save(&session(EngineState::Complete, yesterday)).unwrap();
        assert_eq!(other.party, 1);
    }

    #[test]
    fn test_saved_party_files() {
        let root = tempfile::TempDir::new().unwrap();
        let archive = ResultArchive::new(root.path(), 1);
        let archived = session(EngineState::Complete, Local::now());
        let record = archive.save(&archived).unwrap();

        assert_eq!(record.session, archived.id);
        assert_eq!(record.points, 6);
        assert_eq!(record.rejected, 0);
        assert!((record.duration_s - 125.0).abs() < 1e-9);
        assert!((record.max_hysteresis - 0.5).abs() < 1e-9);

        let table = GraduationTable::load(record.dir.join(TABLE_FILE)).unwrap();
        assert_eq!(table, archived.table);

        let scale = fs::read_to_string(record.dir.join(SCALE_FILE)).unwrap();
        let lines: Vec<&str> = scale.lines().collect();
        assert_eq!(lines[0], SCALE_HEADER);
        assert_eq!(lines[1], "MP-15");
        assert_eq!(
            lines[3],
            "  1.00000000000E+01  9.05000000000E+01  9.10000000000E+01  0.00000000000E+00  0.00000000000E+00"
        );
        assert_eq!(lines[5], "Graduation time: 02:05 sec.");
    }

    #[test]
    fn test_history_and_find() {
        let root = tempfile::TempDir::new().unwrap();
        let archive = ResultArchive::new(root.path(), 2);
        assert!(archive.history().unwrap().is_empty());

        let now = Local::now();
        let older = session(EngineState::Complete, now - chrono::Duration::days(2));
        let newer = session(EngineState::Complete, now);
        archive.save(&newer).unwrap();
        archive.save(&older).unwrap();
        let broken = archive.day_dir(now.date_naive()).join("p9");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(RECORD_FILE), "{").unwrap();

        let history = archive.history().unwrap();
        let ids: Vec<Uuid> = history.iter().map(|r| r.session).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
        assert_eq!(archive.find(newer.id).unwrap().unwrap().party, 1);
        assert!(archive.find(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_only_complete_sessions_are_saved() {
        let root = tempfile::TempDir::new().unwrap();
        let archive = ResultArchive::new(root.path(), 1);
        assert!(matches!(
            archive.save(&session(EngineState::Aborted, Local::now())),
            Err(ArchiveError::NotComplete(EngineState::Aborted))
        ));
        assert!(archive.history().unwrap().is_empty());
    }
}
