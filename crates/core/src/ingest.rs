use crate::models::IngestReport;
use crate::pipeline::RagPipeline;
use crate::IngestError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderReport {
    pub ingested: Vec<IngestReport>,
    pub skipped_files: Vec<SkippedPdf>,
}

impl FolderReport {
    pub fn stored_vectors(&self) -> usize {
        self.ingested.iter().map(|report| report.stored_vectors).sum()
    }
}

/// Ingests every PDF under `folder`; a failing file is recorded and the batch continues.
pub async fn ingest_folder(
    pipeline: &RagPipeline,
    folder: &Path,
) -> Result<FolderReport, IngestError> {
    let files = discover_pdf_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            folder.display()
        )));
    }

    let mut ingested = Vec::new();
    let mut skipped_files = Vec::new();

    for path in files {
        match pipeline.ingest(&path).await {
            Ok(report) => ingested.push(report),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipped pdf");
                skipped_files.push(SkippedPdf {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        folder = %folder.display(),
        ingested = ingested.len(),
        skipped = skipped_files.len(),
        "folder ingestion finished"
    );

    Ok(FolderReport {
        ingested,
        skipped_files,
    })
}
