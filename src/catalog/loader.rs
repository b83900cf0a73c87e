//! Loading gauge model files (`*.cfm`) from a catalog directory.
//!
//! Layout of a model file (blank lines ignored):
//!
//! ```text
//! line 1   free-text title
//! line 2   pressure unit key            (kgf/cm2, MPa, bar, ...)
//! line 3   printing template name
//! line 4   accuracy class               (1.5)
//! line 5   nominal scale angle, degrees (270)
//! line 6   node pressures               (0 10 20 30 ...)
//! line 7+  optional `pressure angle` rows overriding the expected angle of a node
//! ```
//!
//! The model name is the file stem.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use super::model::{GaugeModel, ModelError, ScalePoint};
use crate::units::PressureUnit;

/// Extension of gauge model files.
pub const MODEL_FILE_EXTENSION: &str = "cfm";

/// Minimum number of non-empty lines in a model file.
pub const MIN_MODEL_LINES: usize = 6;

static TOKEN_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s;,]+").expect("token separator pattern is valid"));

/// Catalog loading errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Catalog directory not found: {}", path.display())]
    CatalogNotFound { path: PathBuf },
    #[error("No model files (*.cfm) in {}", path.display())]
    NoModelFiles { path: PathBuf },
    #[error("No gauge model could be loaded from {} ({skipped} file(s) skipped)", path.display())]
    NoModelsLoaded { path: PathBuf, skipped: usize },
    #[error("Cannot read {file}: {reason}")]
    Io { file: String, reason: String },
    #[error("File {file} is malformed: too few lines ({got} < 6)")]
    TooFewLines { file: String, got: usize },
    #[error("Number parse error in {file}: '{token}'")]
    NumberParseError { file: String, token: String },
    #[error("Unknown pressure unit in {file}: '{key}'")]
    UnknownUnit { file: String, key: String },
    #[error("File {file} has no pressure points")]
    NoPressurePoints { file: String },
    #[error("Malformed row {line} in {file}: expected `pressure angle`, got {got} token(s)")]
    MalformedRow { file: String, line: usize, got: usize },
    #[error("Invalid gauge model in {file}: {reason}")]
    InvalidModel { file: String, reason: String },
}

/// Informational events produced while loading a catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    Loaded { name: String },
    Skipped { file: String, reason: CatalogError },
}

/// Result of loading a catalog directory.
#[derive(Debug, Clone)]
pub struct CatalogLoad {
    pub models: Vec<Arc<GaugeModel>>,
    pub events: Vec<CatalogEvent>,
}

impl CatalogLoad {
    /// Number of skipped files.
    pub fn skipped(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, CatalogEvent::Skipped { .. }))
            .count()
    }
}

/// Load every model file in `dir`.
///
/// A malformed file is skipped with a warning; the load only fails when no
/// model could be read at all.
pub fn load(dir: impl AsRef<Path>) -> Result<CatalogLoad, CatalogError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        tracing::error!("Catalog directory not found: {}", dir.display());
        return Err(CatalogError::CatalogNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| CatalogError::Io {
            file: dir.display().to_string(),
            reason: e.to_string(),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case(MODEL_FILE_EXTENSION))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();

    if files.is_empty() {
        tracing::warn!("No model files in {}", dir.display());
        return Err(CatalogError::NoModelFiles {
            path: dir.to_path_buf(),
        });
    }

    let mut models = Vec::new();
    let mut events = Vec::new();
    for path in &files {
        match parse_model_file(path) {
            Ok(model) => {
                tracing::info!("Loaded gauge model {}", model.name());
                events.push(CatalogEvent::Loaded {
                    name: model.name().to_string(),
                });
                models.push(Arc::new(model));
            }
            Err(reason) => {
                tracing::warn!("Skipping {}: {}", path.display(), reason);
                events.push(CatalogEvent::Skipped {
                    file: path.display().to_string(),
                    reason,
                });
            }
        }
    }

    if models.is_empty() {
        tracing::error!("No gauge model could be loaded from {}", dir.display());
        return Err(CatalogError::NoModelsLoaded {
            path: dir.to_path_buf(),
            skipped: events.len(),
        });
    }

    tracing::info!("Loaded {} gauge model(s) from {}", models.len(), dir.display());
    Ok(CatalogLoad { models, events })
}

/// Parse a single model file; the model is named after the file stem.
pub fn parse_model_file(path: &Path) -> Result<GaugeModel, CatalogError> {
    let file = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| CatalogError::Io {
        file: file.clone(),
        reason: e.to_string(),
    })?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.clone());
    parse_model_text(&file, &name, &text)
}

/// Parse model file contents. `file` is only used in error messages.
pub fn parse_model_text(file: &str, name: &str, text: &str) -> Result<GaugeModel, CatalogError> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < MIN_MODEL_LINES {
        return Err(CatalogError::TooFewLines {
            file: file.to_string(),
            got: lines.len(),
        });
    }

    let unit: PressureUnit = lines[1].parse().map_err(|_| CatalogError::UnknownUnit {
        file: file.to_string(),
        key: lines[1].to_string(),
    })?;
    let printing_template = lines[2];
    let accuracy_class = parse_number(file, lines[3])?;
    let nominal_angle = parse_number(file, lines[4])?;

    let pressures = tokens(lines[5])
        .map(|t| parse_number(file, t))
        .collect::<Result<Vec<f64>, _>>()?;
    if pressures.is_empty() {
        return Err(CatalogError::NoPressurePoints {
            file: file.to_string(),
        });
    }

    let mut points = linear_scale(&pressures, nominal_angle);

    for (offset, row) in lines[MIN_MODEL_LINES..].iter().enumerate() {
        let values = tokens(row)
            .map(|t| parse_number(file, t))
            .collect::<Result<Vec<f64>, _>>()?;
        if values.len() != 2 {
            return Err(CatalogError::MalformedRow {
                file: file.to_string(),
                line: MIN_MODEL_LINES + offset + 1,
                got: values.len(),
            });
        }
        let (pressure, angle) = (values[0], values[1]);
        let node = points
            .iter_mut()
            .find(|p| (p.pressure - pressure).abs() < 1e-9)
            .ok_or_else(|| CatalogError::InvalidModel {
                file: file.to_string(),
                reason: format!("row pressure {} is not a scale node", pressure),
            })?;
        node.angle = angle;
    }

    GaugeModel::new(name, unit, accuracy_class, points)
        .map(|m| m.with_printing_template(printing_template))
        .map_err(|e: ModelError| CatalogError::InvalidModel {
            file: file.to_string(),
            reason: e.to_string(),
        })
}

fn tokens(line: &str) -> impl Iterator<Item = &str> {
    TOKEN_SEPARATOR.split(line).filter(|t| !t.is_empty())
}

fn parse_number(file: &str, token: &str) -> Result<f64, CatalogError> {
    token
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CatalogError::NumberParseError {
            file: file.to_string(),
            token: token.trim().to_string(),
        })
}

/// Spread `nominal_angle` linearly over the node pressures.
fn linear_scale(pressures: &[f64], nominal_angle: f64) -> Vec<ScalePoint> {
    let first = pressures[0];
    let range = pressures[pressures.len() - 1] - first;
    pressures
        .iter()
        .map(|&p| {
            let angle = if range > 0.0 {
                nominal_angle * (p - first) / range
            } else {
                0.0
            };
            ScalePoint::new(p, angle)
        })
        .collect()
}

/// In-memory catalog of gauge models, reloadable as a whole.
#[derive(Debug, Default)]
pub struct GaugeCatalog {
    models: RwLock<Arc<Vec<Arc<GaugeModel>>>>,
}

impl GaugeCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `dir` and build a catalog from it.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<(Self, CatalogLoad), CatalogError> {
        let catalog = Self::new();
        let load = catalog.reload(dir)?;
        Ok((catalog, load))
    }

    /// Reload from `dir`. The current set is replaced only when the load succeeds.
    pub fn reload(&self, dir: impl AsRef<Path>) -> Result<CatalogLoad, CatalogError> {
        let load = load(dir)?;
        let fresh = Arc::new(load.models.clone());
        match self.models.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        Ok(load)
    }

    /// Snapshot of all models.
    pub fn all(&self) -> Arc<Vec<Arc<GaugeModel>>> {
        match self.models.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Model names in catalog order.
    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|m| m.name().to_string()).collect()
    }

    /// Find a model by name, ignoring case.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<GaugeModel>> {
        self.all()
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Find a model by its position in the catalog.
    pub fn find_by_index(&self, index: usize) -> Option<Arc<GaugeModel>> {
        self.all().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.all().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID: &str = "Manometer MP-100\nkgf/cm2\nMP-A3\n1.5\n270\n0 10 20 30\n";

    fn write(dir: &TempDir, name: &str, text: &str) {
        fs::write(dir.path().join(name), text).unwrap();
    }

    #[test]
    fn test_parse_valid_model() {
        let model = parse_model_text("mp.cfm", "MP-100", VALID).unwrap();
        assert_eq!(model.name(), "MP-100");
        assert_eq!(model.unit(), PressureUnit::Kgf);
        assert_eq!(model.printing_template(), "MP-A3");
        assert_eq!(model.accuracy_class(), 1.5);
        assert_eq!(model.pressures(), vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(model.scale_points()[1].angle, 90.0);
        assert_eq!(model.angle_span(), 270.0);
    }

    #[test]
    fn test_nonlinearity_rows_override_nodes() {
        let text = format!("{}10 88.5\n20;181\n", VALID);
        let model = parse_model_text("mp.cfm", "MP-100", &text).unwrap();
        assert_eq!(model.scale_points()[1].angle, 88.5);
        assert_eq!(model.scale_points()[2].angle, 181.0);
        assert_eq!(model.scale_points()[3].angle, 270.0);
    }

    #[test]
    fn test_too_few_lines() {
        let err = parse_model_text("short.cfm", "short", "a\nkPa\n\n\nb\n").unwrap_err();
        assert_eq!(
            err,
            CatalogError::TooFewLines {
                file: "short.cfm".to_string(),
                got: 3
            }
        );
    }

    #[test]
    fn test_number_parse_error() {
        let text = "t\nMPa\ntpl\n1,5\n270\n0 1 2\n";
        let err = parse_model_text("comma.cfm", "comma", text).unwrap_err();
        assert_eq!(
            err,
            CatalogError::NumberParseError {
                file: "comma.cfm".to_string(),
                token: "1,5".to_string()
            }
        );

        let text = "t\nMPa\ntpl\n1.5\n270\n0 1 x2\n";
        let err = parse_model_text("token.cfm", "token", text).unwrap_err();
        assert!(matches!(err, CatalogError::NumberParseError { token, .. } if token == "x2"));
    }

    #[test]
    fn test_no_pressure_points() {
        let text = "t\nMPa\ntpl\n1.5\n270\n;\n";
        let err = parse_model_text("empty.cfm", "empty", text).unwrap_err();
        assert!(matches!(err, CatalogError::NoPressurePoints { .. }));
    }

    #[test]
    fn test_row_for_unknown_node() {
        let text = format!("{}15 40\n", VALID);
        let err = parse_model_text("mp.cfm", "MP-100", &text).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidModel { .. }));
    }

    #[test]
    fn test_load_skips_malformed_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "good.cfm", VALID);
        write(&dir, "bad.cfm", "only\ntwo lines\n");
        write(&dir, "notes.txt", "ignored");

        let load = load(dir.path()).unwrap();
        assert_eq!(load.models.len(), 1);
        assert_eq!(load.models[0].name(), "good");
        assert_eq!(load.skipped(), 1);
        assert!(load.events.iter().any(|e| matches!(
            e,
            CatalogEvent::Skipped {
                reason: CatalogError::TooFewLines { got: 2, .. },
                ..
            }
        )));
    }

    #[test]
    fn test_load_errors() {
        let missing = load("/definitely/not/a/catalog");
        assert!(matches!(missing, Err(CatalogError::CatalogNotFound { .. })));

        let dir = TempDir::new().unwrap();
        assert!(matches!(load(dir.path()), Err(CatalogError::NoModelFiles { .. })));

        write(&dir, "bad.cfm", "x\n");
        assert!(matches!(
            load(dir.path()),
            Err(CatalogError::NoModelsLoaded { skipped: 1, .. })
        ));
    }

    #[test]
    fn test_catalog_reload_is_atomic() {
        let dir = TempDir::new().unwrap();
        write(&dir, "MP-100.cfm", VALID);
        let (catalog, _) = GaugeCatalog::from_directory(dir.path()).unwrap();
        assert_eq!(catalog.names(), vec!["MP-100".to_string()]);
        assert!(catalog.find_by_name("mp-100").is_some());
        assert!(catalog.find_by_index(1).is_none());

        let empty = TempDir::new().unwrap();
        assert!(catalog.reload(empty.path()).is_err());
        assert_eq!(catalog.len(), 1);
    }
}
