//! CSV ingestion into schema-typed rows.
//!
//! Cells are trimmed and parsed according to the schema. Columns the schema
//! does not declare are dropped unless listed in `keep` (the target column),
//! in which case they are read as raw categoricals.
//!
//! Training data goes through [`read_csv`], which enforces the allowed
//! category sets. Batches read for drift comparison go through
//! [`read_batch`]: types are still checked, but unseen categories are kept.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use ckdflow_core::error::{Error, Result};
use ckdflow_core::schema::{FeatureSchema, FeatureSpec, MISSING_TOKENS};
use ckdflow_core::types::{Dataset, Row, Value};

enum Column<'a> {
    Feature(&'a FeatureSpec),
    Kept(String),
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Categories {
    Allowed,
    Open,
}

pub fn read_csv<R: Read>(reader: R, schema: &FeatureSchema, keep: &[&str]) -> Result<Dataset> {
    read_with(reader, schema, keep, Categories::Allowed)
}

pub fn read_csv_path(path: &Path, schema: &FeatureSchema, keep: &[&str]) -> Result<Dataset> {
    read_with(open(path)?, schema, keep, Categories::Allowed)
}

/// Like [`read_csv`], without the allowed-set check on categoricals.
pub fn read_batch<R: Read>(reader: R, schema: &FeatureSchema, keep: &[&str]) -> Result<Dataset> {
    read_with(reader, schema, keep, Categories::Open)
}

pub fn read_batch_path(path: &Path, schema: &FeatureSchema, keep: &[&str]) -> Result<Dataset> {
    read_with(open(path)?, schema, keep, Categories::Open)
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))
}

fn read_with<R: Read>(
    reader: R,
    schema: &FeatureSchema,
    keep: &[&str],
    categories: Categories,
) -> Result<Dataset> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns: Vec<Column<'_>> = rdr
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(|h| match schema.get(h) {
            Some(spec) => Column::Feature(spec),
            None if keep.contains(&h) => Column::Kept(h.to_string()),
            None => Column::Skipped,
        })
        .collect();

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(csv_error)?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let mut row = Row::new();
        for (column, cell) in columns.iter().zip(record.iter()) {
            match column {
                Column::Feature(spec) => {
                    let parsed = match categories {
                        Categories::Allowed => spec.parse_cell(cell),
                        Categories::Open => spec.parse_typed(cell),
                    };
                    let value = parsed.map_err(|e| Error::Schema(format!("line {line}: {e}")))?;
                    row.insert(spec.name.clone(), value);
                }
                Column::Kept(name) => {
                    let value = if MISSING_TOKENS.contains(&cell) {
                        Value::Missing
                    } else {
                        Value::Cat(cell.to_string())
                    };
                    row.insert(name.clone(), value);
                }
                Column::Skipped => {}
            }
        }
        rows.push(row);
    }
    tracing::debug!(rows = rows.len(), columns = columns.len(), "csv read");
    Ok(Dataset::new(rows))
}

fn csv_error(e: csv::Error) -> Error {
    if e.is_io_error() {
        Error::Storage(e.to_string())
    } else {
        Error::Schema(format!("malformed csv: {e}"))
    }
}
