//! NDJSON writer for scored records.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::ExportError;
use crate::storage::{ScoredRecord, ScoredSource};

/// Records written to each output file.
pub const RECORDS_PER_FILE: usize = 10_000;

/// Rows fetched from the store per query.
const PAGE_SIZE: usize = 1_000;

/// One exported line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub id: i64,
    /// Lowercased reference key.
    pub identifier: Option<String>,
    pub score: f64,
    pub evaluation_date: Option<String>,
}

impl From<ScoredRecord> for ExportRecord {
    fn from(record: ScoredRecord) -> Self {
        Self {
            id: record.id,
            identifier: record
                .doi
                .map(|doi| doi.trim().to_lowercase())
                .filter(|doi| !doi.is_empty()),
            score: record.score,
            evaluation_date: record
                .evaluation_date
                .map(|d| d.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
        }
    }
}

/// What an export produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    pub records: u64,
    pub files: Vec<PathBuf>,
}

/// Pages through scored records and writes them to numbered files.
#[derive(Debug, Clone)]
pub struct NdjsonExporter {
    output_dir: PathBuf,
    records_per_file: usize,
    page_size: usize,
}

impl NdjsonExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            records_per_file: RECORDS_PER_FILE,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_records_per_file(mut self, records_per_file: usize) -> Self {
        self.records_per_file = records_per_file;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes every scored record in `source`, ordered by id.
    pub async fn export<S>(&self, source: &S) -> Result<ExportSummary, ExportError>
    where
        S: ScoredSource + ?Sized,
    {
        if self.records_per_file == 0 || self.page_size == 0 {
            return Err(ExportError::InvalidSetting(
                "records per file and page size must be greater than 0".to_string(),
            ));
        }
        fs::create_dir_all(&self.output_dir)?;

        let total = source.count_scored().await?;
        info!(
            total = total,
            output_dir = %self.output_dir.display(),
            "Exporting scored records"
        );

        let mut summary = ExportSummary::default();
        let mut writer: Option<BufWriter<File>> = None;
        let mut in_file = 0;
        let mut after_id = i64::MIN;

        loop {
            let page = source.scored_page(after_id, self.page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            let page_len = page.len();

            for record in page {
                if in_file == self.records_per_file {
                    if let Some(mut full) = writer.take() {
                        full.flush()?;
                    }
                    in_file = 0;
                }

                if writer.is_none() {
                    let path = self
                        .output_dir
                        .join(format!("{}.ndjson", summary.files.len() + 1));
                    debug!(path = %path.display(), "Opening export file");
                    writer = Some(BufWriter::new(File::create(&path)?));
                    summary.files.push(path);
                }
                if let Some(out) = writer.as_mut() {
                    serde_json::to_writer(&mut *out, &ExportRecord::from(record))?;
                    out.write_all(b"\n")?;
                }
                in_file += 1;
                summary.records += 1;
            }

            if page_len < self.page_size {
                break;
            }
        }

        if let Some(mut out) = writer {
            out.flush()?;
        }

        info!(
            records = summary.records,
            files = summary.files.len(),
            "Export finished"
        );
        Ok(summary)
    }
}
