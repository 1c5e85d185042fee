//! The workbook file and its store.
//!
//! A document is a versioned JSON workbook holding exactly one sheet. Reads
//! go straight to disk; every change is a load-modify-save cycle run through
//! the store's [`SingleWriter`] and committed with an atomic rename.
//!
//! ## Cell projection
//!
//! `read_range` flattens stored cells to [`CellValue`]s:
//!
//! | Stored       | Read as                                  |
//! |--------------|------------------------------------------|
//! | empty        | `null`                                   |
//! | text/number/boolean | the literal                       |
//! | date         | RFC 3339 string, UTC, millisecond precision |
//! | formula      | its cached result                        |
//! | error        | its code string, e.g. `#DIV/0!`          |

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use tabula_types::{AddressError, CellAddress, CellRange, CellValue, parse_cell, parse_range};

use crate::atomic;
use crate::config::TabulaConfig;
use crate::writer::SingleWriter;

/// Bumped whenever the on-disk layout changes incompatibly.
pub const DOCUMENT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("sheet {requested:?} is not available; this workbook only has {supported:?}")]
    UnsupportedSheet { requested: String, supported: String },

    #[error("cell {0} does not contain a formula")]
    NoFormulaPresent(String),

    #[error("cannot read workbook {}: {source}", .path.display())]
    DocumentUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("workbook {} is corrupt: {reason}", .path.display())]
    DocumentCorrupt { path: PathBuf, reason: String },

    #[error("cannot write workbook {}: {source}", .path.display())]
    DocumentWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} cannot be stored; cell numbers must be finite")]
    NonFiniteNumber(f64),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("workbook task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// A cell as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoredCell {
    Text { value: String },
    Number { value: f64 },
    Boolean { value: bool },
    Date { value: DateTime<Utc> },
    /// `formula` is stored without the leading `=`.
    Formula { formula: String, result: CellValue },
    Error { code: String },
}

impl StoredCell {
    /// What a client write of `value` stores. `None` clears the cell.
    ///
    /// Text starting with `=` (and longer than just `=`) becomes a formula
    /// whose cached result is `0` until something recalculates it.
    pub fn from_value(value: &CellValue) -> Option<Self> {
        Some(match value {
            CellValue::Null => return None,
            CellValue::Bool(b) => StoredCell::Boolean { value: *b },
            CellValue::Number(n) => StoredCell::Number { value: *n },
            CellValue::Text(s) => match value.formula_text() {
                Some(body) => StoredCell::Formula {
                    formula: body.to_string(),
                    result: CellValue::Number(0.0),
                },
                None => StoredCell::Text { value: s.clone() },
            },
        })
    }

    pub fn to_value(&self) -> CellValue {
        match self {
            StoredCell::Text { value } => CellValue::Text(value.clone()),
            StoredCell::Number { value } => CellValue::Number(*value),
            StoredCell::Boolean { value } => CellValue::Bool(*value),
            StoredCell::Date { value } => {
                CellValue::Text(value.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            StoredCell::Formula { result, .. } => result.clone(),
            StoredCell::Error { code } => CellValue::Text(code.clone()),
        }
    }

    pub fn formula(&self) -> Option<&str> {
        match self {
            StoredCell::Formula { formula, .. } => Some(formula),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    /// Used extent. Widened by writes, never narrowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<CellRange>,
    #[serde(default)]
    pub cells: BTreeMap<CellAddress, StoredCell>,
}

impl Sheet {
    pub fn get(&self, cell: CellAddress) -> Option<&StoredCell> {
        self.cells.get(&cell)
    }

    /// Store (or clear, for `Null`) one cell.
    pub fn set(&mut self, cell: CellAddress, value: &CellValue) {
        match StoredCell::from_value(value) {
            Some(stored) => {
                self.cells.insert(cell, stored);
                self.dimension = Some(match self.dimension {
                    Some(dim) => dim.widened_to(cell),
                    None => CellRange::single(cell),
                });
            }
            None => {
                self.cells.remove(&cell);
            }
        }
    }

    /// Row-major grid of projected values; missing cells are `Null`.
    pub fn grid(&self, range: CellRange) -> Vec<Vec<CellValue>> {
        range
            .rows()
            .map(|row| {
                row.map(|cell| self.get(cell).map(StoredCell::to_value).unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub version: u32,
    pub sheets: BTreeMap<String, Sheet>,
}

impl Document {
    /// An empty workbook with one sheet.
    pub fn new(sheet: impl Into<String>) -> Self {
        Self {
            version: DOCUMENT_FORMAT_VERSION,
            sheets: BTreeMap::from([(sheet.into(), Sheet::default())]),
        }
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.get(name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut Sheet> {
        self.sheets.get_mut(name)
    }
}

/// The result of a successful cell write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellUpdate {
    pub sheet: String,
    pub cell: String,
    pub value: CellValue,
}

/// Path and sheet of one workbook file. Cloned into blocking tasks.
#[derive(Debug, Clone)]
struct WorkbookFile {
    path: PathBuf,
    sheet: String,
}

impl WorkbookFile {
    fn corrupt(&self, reason: String) -> DocumentError {
        DocumentError::DocumentCorrupt {
            path: self.path.clone(),
            reason,
        }
    }

    fn load(&self) -> DocumentResult<Document> {
        let bytes = fs::read(&self.path).map_err(|source| DocumentError::DocumentUnreadable {
            path: self.path.clone(),
            source,
        })?;
        let doc: Document =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;
        if doc.version != DOCUMENT_FORMAT_VERSION {
            return Err(self.corrupt(format!("unsupported format version {}", doc.version)));
        }
        if doc.sheet(&self.sheet).is_none() {
            return Err(self.corrupt(format!("missing sheet {:?}", self.sheet)));
        }
        Ok(doc)
    }

    fn save(&self, doc: &Document) -> DocumentResult<()> {
        let write_failed = |source: io::Error| DocumentError::DocumentWriteFailed {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(doc).map_err(|e| write_failed(io::Error::other(e)))?;
        atomic::write_bytes(&self.path, &bytes).map_err(write_failed)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "workbook saved");
        Ok(())
    }

    fn write_cell(
        &self,
        doc: &mut Document,
        cell: CellAddress,
        value: &CellValue,
    ) -> DocumentResult<CellUpdate> {
        let target = doc
            .sheet_mut(&self.sheet)
            .ok_or_else(|| self.corrupt(format!("missing sheet {:?}", self.sheet)))?;
        target.set(cell, value);
        Ok(CellUpdate {
            sheet: self.sheet.clone(),
            cell: cell.to_a1(),
            value: value.clone(),
        })
    }
}

/// Run file I/O off the async workers.
async fn run_blocking<T, F>(work: F) -> DocumentResult<T>
where
    F: FnOnce() -> DocumentResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// Owns the workbook path and serializes writers to it.
pub struct DocumentStore {
    file: WorkbookFile,
    max_read_cells: u64,
    writer: SingleWriter,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>, sheet: impl Into<String>, max_read_cells: u64) -> Self {
        Self {
            file: WorkbookFile {
                path: path.into(),
                sheet: sheet.into(),
            },
            max_read_cells,
            writer: SingleWriter::new(),
        }
    }

    /// Build a store from config, sweeping temp files left by a crash.
    pub fn open(config: &TabulaConfig) -> Self {
        let store = Self::new(&config.document_path, &config.sheet, config.max_read_cells);
        store.sweep_orphans();
        store
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn sheet_name(&self) -> &str {
        &self.file.sheet
    }

    pub fn writer(&self) -> &SingleWriter {
        &self.writer
    }

    /// Reject any sheet other than the one this store serves.
    pub fn check_sheet(&self, requested: &str) -> DocumentResult<()> {
        if requested == self.file.sheet {
            Ok(())
        } else {
            Err(DocumentError::UnsupportedSheet {
                requested: requested.to_string(),
                supported: self.file.sheet.clone(),
            })
        }
    }

    /// Reject values the workbook format cannot hold. JSON has no NaN or
    /// infinity.
    pub fn check_value(&self, value: &CellValue) -> DocumentResult<()> {
        match value {
            CellValue::Number(n) if !n.is_finite() => Err(DocumentError::NonFiniteNumber(*n)),
            _ => Ok(()),
        }
    }

    pub fn load(&self) -> DocumentResult<Document> {
        self.file.load()
    }

    /// Atomically replace the workbook with `doc`.
    pub fn save(&self, doc: &Document) -> DocumentResult<()> {
        self.file.save(doc)
    }

    /// Write an empty workbook if none exists. Returns `true` if one was made.
    pub fn create_if_missing(&self) -> DocumentResult<bool> {
        if self.file.path.exists() {
            return Ok(false);
        }
        self.save(&Document::new(&self.file.sheet))?;
        info!(path = %self.file.path.display(), sheet = %self.file.sheet, "created workbook");
        Ok(true)
    }

    pub fn sweep_orphans(&self) -> usize {
        atomic::sweep_orphans(&self.file.path)
    }

    /// Values in `range_text` as a row-major grid.
    #[instrument(skip(self), fields(path = %self.file.path.display()))]
    pub fn read_range(&self, sheet: &str, range_text: &str) -> DocumentResult<Vec<Vec<CellValue>>> {
        self.check_sheet(sheet)?;
        let range = parse_range(range_text, Some(self.max_read_cells))?;
        let doc = self.load()?;
        let grid = doc
            .sheet(&self.file.sheet)
            .map(|s| s.grid(range))
            .unwrap_or_default();
        Ok(grid)
    }

    /// The formula in `cell`, with its leading `=`.
    pub fn explain_formula(&self, sheet: &str, cell_text: &str) -> DocumentResult<String> {
        self.check_sheet(sheet)?;
        let cell = parse_cell(cell_text)?;
        let doc = self.load()?;
        doc.sheet(&self.file.sheet)
            .and_then(|s| s.get(cell))
            .and_then(StoredCell::formula)
            .map(|f| format!("={f}"))
            .ok_or_else(|| DocumentError::NoFormulaPresent(cell.to_a1()))
    }

    /// Apply one write to an in-memory document. Nothing touches disk.
    pub fn write_cell(
        &self,
        doc: &mut Document,
        sheet: &str,
        cell_text: &str,
        value: &CellValue,
    ) -> DocumentResult<CellUpdate> {
        self.check_sheet(sheet)?;
        self.check_value(value)?;
        let cell = parse_cell(cell_text)?;
        self.file.write_cell(doc, cell, value)
    }

    /// Load, write one cell, and save, holding the writer slot throughout.
    #[instrument(skip(self, value), fields(path = %self.file.path.display()))]
    pub async fn update_cell(
        &self,
        sheet: &str,
        cell_text: &str,
        value: CellValue,
    ) -> DocumentResult<CellUpdate> {
        self.check_sheet(sheet)?;
        self.check_value(&value)?;
        let cell = parse_cell(cell_text)?;
        let file = self.file.clone();
        self.writer
            .run(move || {
                run_blocking(move || {
                    let mut doc = file.load()?;
                    let update = file.write_cell(&mut doc, cell, &value)?;
                    file.save(&doc)?;
                    Ok(update)
                })
            })
            .await
    }

    /// Run a synchronous load-modify-save cycle with exclusive access.
    ///
    /// `edit` sees the whole document and bypasses [`Self::check_value`].
    /// A failed edit leaves the file untouched.
    pub async fn modify<T, F>(&self, edit: F) -> DocumentResult<T>
    where
        F: FnOnce(&mut Document) -> DocumentResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let file = self.file.clone();
        self.writer
            .run(move || {
                run_blocking(move || {
                    let mut doc = file.load()?;
                    let out = edit(&mut doc)?;
                    file.save(&doc)?;
                    Ok(out)
                })
            })
            .await
    }
}
