//! Gauge model catalog: model records, preload coefficients and file loading.

mod loader;
mod model;
mod preload;

pub use loader::{
    load, parse_model_file, parse_model_text, CatalogError, CatalogEvent, CatalogLoad,
    GaugeCatalog, MIN_MODEL_LINES, MODEL_FILE_EXTENSION,
};
pub use model::{GaugeModel, ModelError, ScalePoint};
pub use preload::{PreloadEntry, PreloadTable};
