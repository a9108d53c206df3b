/*!
 * Export functionality for match results
 *
 * Writes the matched rows of a [`MatchResult`] as a JSON document, JSON
 * Lines, or CSV. CSV columns are the union of all row keys in first-seen
 * order, so rows matched by name (which may lack a pharmacy code column)
 * still line up.
 */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::Value;

use crate::matcher::{MatchResult, MatchedRow};
use crate::{ExportFormat, Result, SupplyCheckError};

/// Trait for match-result exporters
pub trait ResultExporter {
    /// Write `result` to `writer`
    fn write(&self, result: &MatchResult, writer: &mut dyn Write) -> Result<()>;

    /// Get the export format
    fn format(&self) -> ExportFormat;

    /// Write `result` to a file at `path`
    fn export(&self, result: &MatchResult, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write(result, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// JSON exporter
pub struct JsonExporter {
    /// Whether to pretty-print the JSON
    pub pretty_print: bool,
    /// Whether to export as JSON Lines (one matched row per line)
    pub json_lines: bool,
}

impl Default for JsonExporter {
    fn default() -> Self {
        Self {
            pretty_print: true,
            json_lines: false,
        }
    }
}

impl JsonExporter {
    /// Create a new JSON exporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pretty printing
    pub fn with_pretty_print(mut self, pretty: bool) -> Self {
        self.pretty_print = pretty;
        self
    }

    /// Set JSON Lines format
    pub fn as_json_lines(mut self) -> Self {
        self.json_lines = true;
        self.pretty_print = false;
        self
    }
}

impl ResultExporter for JsonExporter {
    fn write(&self, result: &MatchResult, writer: &mut dyn Write) -> Result<()> {
        if self.json_lines {
            for row in &result.data {
                serde_json::to_writer(&mut *writer, row)?;
                writeln!(writer)?;
            }
        } else if self.pretty_print {
            serde_json::to_writer_pretty(&mut *writer, result)?;
            writeln!(writer)?;
        } else {
            serde_json::to_writer(&mut *writer, result)?;
            writeln!(writer)?;
        }
        Ok(())
    }

    fn format(&self) -> ExportFormat {
        if self.json_lines {
            ExportFormat::JsonLines
        } else {
            ExportFormat::Json
        }
    }
}

/// CSV exporter
pub struct CsvExporter {
    /// Whether to include headers
    pub include_headers: bool,
    /// Field delimiter
    pub delimiter: u8,
}

impl Default for CsvExporter {
    fn default() -> Self {
        Self {
            include_headers: true,
            delimiter: b',',
        }
    }
}

impl CsvExporter {
    /// Create a new CSV exporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delimiter
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

impl ResultExporter for CsvExporter {
    fn write(&self, result: &MatchResult, writer: &mut dyn Write) -> Result<()> {
        let headers = union_keys(&result.data);
        let mut csv_writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(writer);

        if self.include_headers && !headers.is_empty() {
            csv_writer.write_record(&headers)?;
        }
        for row in &result.data {
            let record: Vec<String> = headers
                .iter()
                .map(|key| row.get(key.as_str()).map(cell_text).unwrap_or_default())
                .collect();
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush().map_err(|e| SupplyCheckError::Export {
            message: e.to_string(),
            format: ExportFormat::Csv,
            suggestion: None,
        })?;
        Ok(())
    }

    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }
}

/// Column names across all rows in first-seen order
fn union_keys(rows: &[MatchedRow]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !keys.iter().any(|k| k == key) {
                keys.push(key.clone());
            }
        }
    }
    keys
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Exporter for a chosen [`ExportFormat`]
pub struct MatchExporter {
    inner: Box<dyn ResultExporter + Send + Sync>,
}

impl MatchExporter {
    pub fn new(format: ExportFormat) -> Self {
        let inner: Box<dyn ResultExporter + Send + Sync> = match format {
            ExportFormat::Json => Box::new(JsonExporter::new()),
            ExportFormat::JsonLines => Box::new(JsonExporter::new().as_json_lines()),
            ExportFormat::Csv => Box::new(CsvExporter::new()),
        };
        Self { inner }
    }

    pub fn format(&self) -> ExportFormat {
        self.inner.format()
    }

    pub fn write(&self, result: &MatchResult, writer: &mut dyn Write) -> Result<()> {
        self.inner.write(result, writer)
    }

    pub fn export<P: AsRef<Path>>(&self, result: &MatchResult, path: P) -> Result<()> {
        self.inner.export(result, path.as_ref())
    }
}

impl MatchResult {
    /// Export to a file in the given format
    pub fn export<P: AsRef<Path>>(&self, path: P, format: ExportFormat) -> Result<()> {
        MatchExporter::new(format).export(self, path)
    }
}
