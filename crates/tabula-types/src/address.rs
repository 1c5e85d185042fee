//! A1-style cell and range coordinates.
//!
//! Rows and columns are **1-indexed** everywhere in this module:
//! - `row = 1` is spreadsheet row `1`
//! - `col = 1` is column `A`
//!
//! Tool inputs never embed a sheet name, so [`parse_range`] rejects any
//! `Sheet!A1` qualifier. Ranges mentioned in chat prose do carry one; those go
//! through [`parse_mention`] instead.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest addressable row (spreadsheet format limit).
pub const MAX_ROWS: u32 = 1_048_576;

/// Highest addressable column (`XFD`).
pub const MAX_COLS: u32 = 16_384;

/// Default cap on the number of cells a single read may cover.
pub const DEFAULT_MAX_CELLS: u64 = 10_000;

/// Column letters are at most three characters (`A`..`XFD`).
const MAX_COLUMN_LETTERS: usize = 3;

/// Errors from parsing or translating coordinates.
///
/// All variants describe bad client input and are safe to show verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid cell address: {0:?}")]
    InvalidAddress(String),

    #[error("{0:?} is outside the sheet bounds ({MAX_ROWS} rows, {MAX_COLS} columns)")]
    OutOfBounds(String),

    #[error("range {0:?} must not include a sheet name; pass the sheet separately")]
    RangeMustNotQualifySheet(String),

    #[error("range covers {count} cells, more than the limit of {limit}")]
    RangeTooLarge { count: u64, limit: u64 },

    #[error("selection offset (row {row}, col {col}) is outside base range {base}")]
    SelectionOutOfBounds { base: String, row: u32, col: u32 },
}

/// A single cell. Ordered row-major.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CellAddress {
    row: u32,
    col: u32,
}

impl CellAddress {
    /// Construct an address, checking the sheet limits.
    pub fn new(row: u32, col: u32) -> Result<Self, AddressError> {
        if row == 0 || col == 0 || row > MAX_ROWS || col > MAX_COLS {
            return Err(AddressError::OutOfBounds(format!("row {row}, col {col}")));
        }
        Ok(Self { row, col })
    }

    #[inline]
    pub const fn row(self) -> u32 {
        self.row
    }

    #[inline]
    pub const fn col(self) -> u32 {
        self.col
    }

    /// Uppercase A1 text, never anchored.
    pub fn to_a1(self) -> String {
        format_cell(self)
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_cell(*self))
    }
}

impl FromStr for CellAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cell(s)
    }
}

impl From<CellAddress> for String {
    fn from(addr: CellAddress) -> Self {
        format_cell(addr)
    }
}

impl TryFrom<String> for CellAddress {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_cell(&s)
    }
}

/// An inclusive rectangle, always normalized so `start <= end` per axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CellRange {
    start: CellAddress,
    end: CellAddress,
}

impl CellRange {
    /// Build a range from two corners in any order.
    pub fn new(a: CellAddress, b: CellAddress) -> Self {
        Self {
            start: CellAddress {
                row: a.row.min(b.row),
                col: a.col.min(b.col),
            },
            end: CellAddress {
                row: a.row.max(b.row),
                col: a.col.max(b.col),
            },
        }
    }

    /// A one-cell range.
    pub fn single(cell: CellAddress) -> Self {
        Self {
            start: cell,
            end: cell,
        }
    }

    #[inline]
    pub const fn start(&self) -> CellAddress {
        self.start
    }

    #[inline]
    pub const fn end(&self) -> CellAddress {
        self.end
    }

    /// Number of columns.
    #[inline]
    pub const fn width(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    /// Number of rows.
    #[inline]
    pub const fn height(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    #[inline]
    pub const fn cell_count(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    #[inline]
    pub const fn is_single_cell(&self) -> bool {
        self.start.row == self.end.row && self.start.col == self.end.col
    }

    pub const fn contains(&self, cell: CellAddress) -> bool {
        cell.row >= self.start.row
            && cell.row <= self.end.row
            && cell.col >= self.start.col
            && cell.col <= self.end.col
    }

    /// Smallest range covering both `self` and `cell`.
    pub fn widened_to(&self, cell: CellAddress) -> Self {
        Self {
            start: CellAddress {
                row: self.start.row.min(cell.row),
                col: self.start.col.min(cell.col),
            },
            end: CellAddress {
                row: self.end.row.max(cell.row),
                col: self.end.col.max(cell.col),
            },
        }
    }

    /// Iterate rows top to bottom, each row left to right.
    pub fn rows(self) -> impl Iterator<Item = impl Iterator<Item = CellAddress>> {
        let (start, end) = (self.start, self.end);
        (start.row..=end.row)
            .map(move |row| (start.col..=end.col).map(move |col| CellAddress { row, col }))
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_range(self))
    }
}

impl FromStr for CellRange {
    type Err = AddressError;

    /// Uncapped parse; use [`parse_range`] to enforce a read limit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_range(s, None)
    }
}

impl From<CellRange> for String {
    fn from(range: CellRange) -> Self {
        format_range(&range)
    }
}

impl TryFrom<String> for CellRange {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_range(&s, None)
    }
}

/// Parse an A1 cell such as `B2`, `$C$10` or `xfd1048576`.
pub fn parse_cell(text: &str) -> Result<CellAddress, AddressError> {
    let s = text.trim();
    let invalid = || AddressError::InvalidAddress(text.to_string());
    let bytes = s.as_bytes();

    let mut idx = 0usize;
    if bytes.get(idx) == Some(&b'$') {
        idx += 1;
    }

    let col_start = idx;
    while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
        idx += 1;
    }
    let letters = &s[col_start..idx];
    if letters.is_empty() || letters.len() > MAX_COLUMN_LETTERS {
        return Err(invalid());
    }

    if bytes.get(idx) == Some(&b'$') {
        idx += 1;
    }

    let row_start = idx;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == row_start || idx != bytes.len() {
        return Err(invalid());
    }

    // Digits only, so a parse failure means the number overflowed.
    let row: u64 = s[row_start..idx]
        .parse()
        .map_err(|_| AddressError::OutOfBounds(text.to_string()))?;
    if row == 0 {
        return Err(invalid());
    }

    let col = letters_to_number(letters).ok_or_else(invalid)?;
    if row > MAX_ROWS as u64 || col > MAX_COLS as u64 {
        return Err(AddressError::OutOfBounds(text.to_string()));
    }

    Ok(CellAddress {
        row: row as u32,
        col: col as u32,
    })
}

/// Format a cell as uppercase A1 text.
pub fn format_cell(addr: CellAddress) -> String {
    format!("{}{}", number_to_letters(addr.col), addr.row)
}

/// Parse `A1` or `A1:B2` (endpoints in any order) into a normalized range.
///
/// `max_cells` caps the covered cell count; `None` leaves it uncapped.
pub fn parse_range(text: &str, max_cells: Option<u64>) -> Result<CellRange, AddressError> {
    let s = text.trim();
    if s.contains('!') {
        return Err(AddressError::RangeMustNotQualifySheet(text.to_string()));
    }

    let range = match s.split_once(':') {
        None => CellRange::single(parse_cell(s)?),
        Some((a, b)) => {
            if b.contains(':') {
                return Err(AddressError::InvalidAddress(text.to_string()));
            }
            CellRange::new(parse_cell(a)?, parse_cell(b)?)
        }
    };

    if let Some(limit) = max_cells {
        let count = range.cell_count();
        if count > limit {
            return Err(AddressError::RangeTooLarge { count, limit });
        }
    }

    Ok(range)
}

/// Format a range as `A1` (single cell) or `A1:B2`.
pub fn format_range(range: &CellRange) -> String {
    if range.is_single_cell() {
        format_cell(range.start)
    } else {
        format!("{}:{}", format_cell(range.start), format_cell(range.end))
    }
}

/// Canonical text for a range: anchors dropped, uppercase, corners ordered.
pub fn normalize_range(text: &str) -> Result<String, AddressError> {
    parse_range(text, None).map(|r| format_range(&r))
}

/// `A` → 1, `Z` → 26, `AA` → 27, … up to `XFD` → 16384.
pub fn column_letters_to_number(letters: &str) -> Result<u32, AddressError> {
    if letters.is_empty() || letters.len() > MAX_COLUMN_LETTERS {
        return Err(AddressError::InvalidAddress(letters.to_string()));
    }
    let n = letters_to_number(letters)
        .ok_or_else(|| AddressError::InvalidAddress(letters.to_string()))?;
    if n > MAX_COLS as u64 {
        return Err(AddressError::OutOfBounds(letters.to_string()));
    }
    Ok(n as u32)
}

/// Inverse of [`column_letters_to_number`].
pub fn column_number_to_letters(col: u32) -> Result<String, AddressError> {
    if col == 0 || col > MAX_COLS {
        return Err(AddressError::OutOfBounds(format!("column {col}")));
    }
    Ok(number_to_letters(col))
}

/// Map a 0-based rectangular selection inside a rendered `base` range back to
/// absolute A1 text.
///
/// The two corners may come in any order.
pub fn selection_to_range(
    base: &str,
    row_offset_start: u32,
    col_offset_start: u32,
    row_offset_end: u32,
    col_offset_end: u32,
) -> Result<String, AddressError> {
    let base_range = parse_range(base, None)?;

    let (row_lo, row_hi) = min_max(row_offset_start, row_offset_end);
    let (col_lo, col_hi) = min_max(col_offset_start, col_offset_end);

    if row_hi >= base_range.height() || col_hi >= base_range.width() {
        return Err(AddressError::SelectionOutOfBounds {
            base: format_range(&base_range),
            row: row_hi,
            col: col_hi,
        });
    }

    let origin = base_range.start;
    let start = CellAddress {
        row: origin.row + row_lo,
        col: origin.col + col_lo,
    };
    let end = CellAddress {
        row: origin.row + row_hi,
        col: origin.col + col_hi,
    };
    Ok(format_range(&CellRange::new(start, end)))
}

/// A range referenced in chat text, optionally qualified with a sheet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeMention {
    pub sheet: Option<String>,
    pub range: CellRange,
}

/// Parse a range mention such as `Sheet1!A1:B2`, `'Q3 Budget'!C4` or `@A1`.
///
/// Quoted sheet names use `''` for a literal quote.
pub fn parse_mention(text: &str) -> Result<RangeMention, AddressError> {
    let s = text.trim();
    let s = s.strip_prefix('@').unwrap_or(s);

    let Some((sheet_part, range_part)) = s.rsplit_once('!') else {
        return Ok(RangeMention {
            sheet: None,
            range: parse_range(s, None)?,
        });
    };

    let sheet = match sheet_part
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        Some(quoted) => quoted.replace("''", "'"),
        None => sheet_part.to_string(),
    };
    if sheet.trim().is_empty() {
        return Err(AddressError::InvalidAddress(text.to_string()));
    }

    Ok(RangeMention {
        sheet: Some(sheet),
        range: parse_range(range_part, None)?,
    })
}

fn min_max(a: u32, b: u32) -> (u32, u32) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Bijective base-26; `None` for non-letters. Callers bound the length.
fn letters_to_number(letters: &str) -> Option<u64> {
    let mut n: u64 = 0;
    for b in letters.bytes() {
        if !b.is_ascii_alphabetic() {
            return None;
        }
        n = n * 26 + u64::from(b.to_ascii_uppercase() - b'A') + 1;
    }
    Some(n)
}

fn number_to_letters(col: u32) -> String {
    let mut n = col;
    let mut out = Vec::with_capacity(MAX_COLUMN_LETTERS);
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    out.iter().rev().collect()
}
