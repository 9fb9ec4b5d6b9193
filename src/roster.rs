//! Delimited roster input and append-only enriched output
//!
//! Both sides share one delimiter and one character encoding. Input is
//! decoded lazily; output rows are encoded, written, flushed and synced one
//! at a time so a written row survives a crash.

use crate::config::{ColumnsConfig, TableConfig};
use crate::error::{EnrichError, Result};
use crate::schema::{LookupStatus, ENRICHMENT_COLUMNS, STATUS_COLUMN};
use encoding_rs::Encoding;
use encoding_rs_io::{DecodeReaderBytes, DecodeReaderBytesBuilder};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One input row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    /// Zero-based data row index (header excluded)
    pub index: usize,
    pub id: String,
    pub given_name: String,
    pub family_name: String,
    /// Every input cell, padded to the header width
    pub fields: Vec<String>,
}

impl InputRecord {
    /// Query string sent to the directory: `"<given> <family>"`.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.given_name.trim(), self.family_name.trim())
            .trim()
            .to_string()
    }

    /// Names of the required lookup fields that are blank.
    pub fn missing_fields<'a>(&self, columns: &'a ColumnsConfig) -> Vec<&'a str> {
        let mut missing = Vec::new();
        if self.family_name.trim().is_empty() {
            missing.push(columns.family_name.as_str());
        }
        if self.given_name.trim().is_empty() {
            missing.push(columns.given_name.as_str());
        }
        missing
    }
}

struct ColumnIndex {
    id: usize,
    given: usize,
    family: usize,
}

/// Lazy reader over the source roster
pub struct Roster {
    headers: Vec<String>,
    columns: ColumnIndex,
    reader: csv::Reader<DecodeReaderBytes<File, Vec<u8>>>,
}

impl Roster {
    pub fn open(path: &Path, table: &TableConfig, columns: &ColumnsConfig) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| EnrichError::io(format!("opening input {}", path.display()), e))?;
        let decoder = DecodeReaderBytesBuilder::new()
            .encoding(Some(table.encoding()?))
            .build(file);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(table.delimiter_byte()?)
            .flexible(true)
            .from_reader(decoder);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let find = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                EnrichError::Input(format!(
                    "{}: required column {:?} not in header",
                    path.display(),
                    name
                ))
            })
        };
        let columns = ColumnIndex {
            id: find(&columns.id)?,
            given: find(&columns.given_name)?,
            family: find(&columns.family_name)?,
        };

        info!(path = %path.display(), columns = headers.len(), "Reading input roster");
        Ok(Self {
            headers,
            columns,
            reader,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Records in file order. Decoding or parse failures end the sequence with an error item.
    pub fn records(self) -> impl Iterator<Item = Result<InputRecord>> {
        let Roster {
            headers,
            columns,
            reader,
        } = self;
        let width = headers.len();

        reader
            .into_records()
            .enumerate()
            .map(move |(index, row)| -> Result<InputRecord> {
                let row = row?;
                let mut fields: Vec<String> = row.iter().map(str::to_string).collect();
                if fields.len() < width {
                    fields.resize(width, String::new());
                }
                Ok(InputRecord {
                    index,
                    id: fields[columns.id].clone(),
                    given_name: fields[columns.given].clone(),
                    family_name: fields[columns.family].clone(),
                    fields,
                })
            })
    }
}

/// Header of the enriched output: input columns, then enrichment columns
pub fn output_header(input_headers: &[String]) -> Vec<String> {
    input_headers
        .iter()
        .cloned()
        .chain(ENRICHMENT_COLUMNS.iter().map(|c| c.to_string()))
        .collect()
}

/// Append-only writer for the enriched table
pub struct OutputTable {
    path: PathBuf,
    file: Option<File>,
    delimiter: u8,
    encoding: &'static Encoding,
    rows_written: u64,
}

impl OutputTable {
    /// Truncate/create `path` and write the header row.
    pub fn create(path: &Path, table: &TableConfig, header: &[String]) -> Result<Self> {
        info!(path = %path.display(), "Creating output file");
        let file = File::create(path)
            .map_err(|e| EnrichError::io(format!("creating output {}", path.display()), e))?;
        let mut out = Self::with_file(path, file, table)?;
        out.write_row(header)?;
        out.rows_written = 0;
        Ok(out)
    }

    /// Open an existing output for appending; no header is written.
    pub fn append(path: &Path, table: &TableConfig) -> Result<Self> {
        info!(path = %path.display(), "Resuming, opening output in append mode");
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| EnrichError::io(format!("opening output {}", path.display()), e))?;
        Self::with_file(path, file, table)
    }

    fn with_file(path: &Path, file: File, table: &TableConfig) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            delimiter: table.delimiter_byte()?,
            encoding: table.encoding()?,
            rows_written: 0,
        })
    }

    /// Encode, write and durably flush one row.
    pub fn write_row<S: AsRef<str>>(&mut self, cells: &[S]) -> Result<()> {
        let mut line = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(Vec::new());
        line.write_record(cells.iter().map(|c| c.as_ref()))?;
        let bytes = line
            .into_inner()
            .map_err(|e| {
                let err = e.error();
                EnrichError::io(
                    "buffering output row",
                    std::io::Error::new(err.kind(), err.to_string()),
                )
            })?;
        let text = String::from_utf8_lossy(&bytes);
        let (encoded, _, unmappable) = self.encoding.encode(&text);
        if unmappable {
            warn!(
                encoding = self.encoding.name(),
                "Output row has characters outside the target encoding"
            );
        }

        let path = &self.path;
        let file = self.file.as_mut().ok_or_else(|| {
            EnrichError::persistence(
                format!("writing {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::Other, "output already closed"),
            )
        })?;
        let start = file
            .metadata()
            .map_err(|e| EnrichError::persistence(format!("writing {}", path.display()), e))?
            .len();
        let written = file
            .write_all(&encoded)
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data());
        if let Err(e) = written {
            // Drop any partial row so the file still ends on a row boundary
            if let Err(trunc) = file
                .set_len(start)
                .and_then(|_| file.seek(SeekFrom::Start(start)).map(|_| ()))
            {
                warn!(path = %path.display(), error = %trunc, "Could not remove partial row");
            }
            return Err(EnrichError::persistence(
                format!("writing {}", path.display()),
                e,
            ));
        }

        self.rows_written += 1;
        Ok(())
    }

    /// Data rows written through this handle.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Sync and release the file handle. Idempotent.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                warn!(error = %e, "Final sync of output failed");
            }
            info!(path = %self.path.display(), rows = self.rows_written, "Output file closed");
        }
    }
}

impl Drop for OutputTable {
    fn drop(&mut self) {
        self.close();
    }
}

/// Statuses of the data rows already in an output file, in file order.
/// Rows whose status cell is unreadable count as ERROR.
pub fn existing_statuses(path: &Path, table: &TableConfig) -> Result<Vec<LookupStatus>> {
    let file = File::open(path)
        .map_err(|e| EnrichError::io(format!("opening output {}", path.display()), e))?;
    let decoder = DecodeReaderBytesBuilder::new()
        .encoding(Some(table.encoding()?))
        .build(file);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(table.delimiter_byte()?)
        .flexible(true)
        .from_reader(decoder);

    let status_col = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == STATUS_COLUMN)
        .ok_or_else(|| {
            EnrichError::Input(format!(
                "{}: no {} column, not an enriched output",
                path.display(),
                STATUS_COLUMN
            ))
        })?;

    let mut statuses = Vec::new();
    for row in reader.into_records() {
        let row = row?;
        let status = row
            .get(status_col)
            .and_then(|s| s.parse().ok())
            .unwrap_or(LookupStatus::Error);
        statuses.push(status);
    }
    Ok(statuses)
}
