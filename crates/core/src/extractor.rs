use crate::chunking::normalize_whitespace;
use crate::config::RagSettings;
use crate::error::{IngestError, ServiceError};
use crate::models::{Document, Metadata};
use crate::traits::{DocumentExtractor, DocumentParser};
use async_trait::async_trait;
use lopdf::Document as PdfDocument;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CLOUD_PARSER: &str = "cloud";
pub const LOCAL_PARSER: &str = "local";

const PARSE_SYSTEM_PROMPT: &str = "You are a precise medical document parser.";
const PARSE_USER_PROMPT: &str =
    "Extract clinically relevant content with headings, lists, and tables.";
const PAGE_SEPARATOR: &str = "\n---\n";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            PdfDocument::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Client for the hosted markdown parsing service: upload, poll the job, fetch markdown.
pub struct CloudParser {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ParseJob {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarkdownResult {
    #[serde(default)]
    markdown: Option<String>,
}

impl CloudParser {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }

    async fn upload(&self, path: &Path) -> Result<String, ServiceError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|error| ServiceError::backend("parser", error.to_string()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "document.pdf".to_string());

        let form = Form::new()
            .part(
                "file",
                Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("application/pdf")?,
            )
            .text("system_prompt", PARSE_SYSTEM_PROMPT)
            .text("user_prompt", PARSE_USER_PROMPT);

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ServiceError::backend(
                "parser",
                format!("upload returned {}", response.status()),
            ));
        }

        let job: ParseJob = response.json().await?;
        Ok(job.id)
    }

    async fn wait_for_markdown(&self, job_id: &str) -> Result<String, ServiceError> {
        loop {
            let job: ParseJob = self
                .client
                .get(format!("{}/job/{job_id}", self.base_url))
                .bearer_auth(&self.api_key)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match job.status.as_deref().unwrap_or("PENDING") {
                "SUCCESS" => break,
                "ERROR" | "CANCELED" | "CANCELLED" => {
                    return Err(ServiceError::backend(
                        "parser",
                        format!("job {} ended in {:?}", job.id, job.status),
                    ));
                }
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        let result: MarkdownResult = self
            .client
            .get(format!("{}/job/{job_id}/result/markdown", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(result.markdown.unwrap_or_default())
    }
}

#[async_trait]
impl DocumentParser for CloudParser {
    async fn parse(&self, path: &Path) -> Result<Vec<Document>, ServiceError> {
        let job = async {
            let job_id = self.upload(path).await?;
            debug!(job_id = %job_id, path = %path.display(), "parse job submitted");
            self.wait_for_markdown(&job_id).await
        };

        let markdown = tokio::time::timeout(self.timeout, job)
            .await
            .map_err(|_| ServiceError::Timeout {
                backend: "parser".to_string(),
                seconds: self.timeout.as_secs(),
            })??;

        Ok(markdown_to_documents(&markdown, path))
    }
}

fn markdown_to_documents(markdown: &str, path: &Path) -> Vec<Document> {
    markdown
        .split(PAGE_SEPARATOR)
        .map(str::trim)
        .filter(|section| !section.is_empty())
        .map(|section| Document {
            text: section.to_string(),
            metadata: Metadata {
                doc_type: Some("text".to_string()),
                parser: Some(CLOUD_PARSER.to_string()),
                ..Metadata::for_source(path.to_string_lossy())
            },
        })
        .collect()
}

/// Tuning for attributing unlabeled documents to local page texts.
#[derive(Debug, Clone, Copy)]
pub struct PageMatchSettings {
    pub prefix_chars: usize,
    pub probe_words: usize,
    pub min_overlap: f64,
}

impl From<&RagSettings> for PageMatchSettings {
    fn from(value: &RagSettings) -> Self {
        Self {
            prefix_chars: value.page_match_prefix_chars,
            probe_words: value.page_match_probe_words,
            min_overlap: value.page_match_min_overlap,
        }
    }
}

struct IndexedPage {
    number: u32,
    lowered: String,
    words: HashSet<String>,
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

/// Best page for `text`: prefix containment first, then word overlap above the threshold.
fn best_page(text: &str, pages: &[IndexedPage], settings: PageMatchSettings) -> Option<u32> {
    let normalized = normalize_whitespace(text).to_lowercase();
    let probe: String = normalized.chars().take(settings.prefix_chars).collect();
    if probe.is_empty() {
        return None;
    }

    if let Some(page) = pages.iter().find(|page| page.lowered.contains(&probe)) {
        return Some(page.number);
    }

    let probe_words: Vec<String> = words(&probe).take(settings.probe_words).collect();
    if probe_words.is_empty() {
        return None;
    }

    let mut best: Option<(u32, f64)> = None;
    for page in pages {
        let hits = probe_words
            .iter()
            .filter(|word| page.words.contains(*word))
            .count();
        let ratio = hits as f64 / probe_words.len() as f64;
        if best.map_or(true, |(_, score)| ratio > score) {
            best = Some((page.number, ratio));
        }
    }

    best.filter(|(_, ratio)| *ratio >= settings.min_overlap)
        .map(|(number, _)| number)
}

/// Fills missing `page_label`s by fuzzy-matching each document against local page texts.
pub fn attribute_pages(
    documents: &mut [Document],
    pages: &[PageText],
    settings: PageMatchSettings,
) {
    let indexed: Vec<IndexedPage> = pages
        .iter()
        .map(|page| IndexedPage {
            number: page.number,
            lowered: normalize_whitespace(&page.text).to_lowercase(),
            words: words(&page.text).collect(),
        })
        .collect();

    for document in documents
        .iter_mut()
        .filter(|document| document.metadata.page_label.is_none())
    {
        document.metadata.page_label = best_page(&document.text, &indexed, settings);
    }
}

fn pages_to_documents(pages: Vec<PageText>, path: &Path) -> Vec<Document> {
    pages
        .into_iter()
        .filter(|page| !page.text.trim().is_empty())
        .map(|page| Document {
            text: page.text,
            metadata: Metadata {
                page_label: Some(page.number),
                doc_type: Some("text".to_string()),
                parser: Some(LOCAL_PARSER.to_string()),
                ..Metadata::for_source(path.to_string_lossy())
            },
        })
        .collect()
}

/// Cloud parsing when configured, local page extraction as fallback and page oracle.
pub struct PageAwareExtractor {
    primary: Option<Arc<dyn DocumentParser>>,
    fallback: Arc<dyn PdfExtractor + Send + Sync>,
    matching: PageMatchSettings,
}

impl PageAwareExtractor {
    pub fn new(
        primary: Option<Arc<dyn DocumentParser>>,
        fallback: Arc<dyn PdfExtractor + Send + Sync>,
        matching: PageMatchSettings,
    ) -> Self {
        Self {
            primary,
            fallback,
            matching,
        }
    }

    pub fn local_only(matching: PageMatchSettings) -> Self {
        Self::new(None, Arc::new(LopdfExtractor), matching)
    }

    async fn local_pages(&self, path: &Path) -> Vec<PageText> {
        let fallback = Arc::clone(&self.fallback);
        let owned: PathBuf = path.to_path_buf();
        match tokio::task::spawn_blocking(move || fallback.extract_pages(&owned)).await {
            Ok(Ok(pages)) => pages,
            Ok(Err(error)) => {
                warn!(path = %path.display(), %error, "local text extraction failed");
                Vec::new()
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "local text extraction task failed");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl DocumentExtractor for PageAwareExtractor {
    async fn extract(&self, path: &Path) -> Result<Vec<Document>, IngestError> {
        if !path.is_file() {
            return Err(IngestError::InvalidArgument(format!(
                "document not found: {}",
                path.display()
            )));
        }

        let mut primary = match &self.primary {
            Some(parser) => parser.parse(path).await.unwrap_or_else(|error| {
                warn!(
                    path = %path.display(),
                    %error,
                    "cloud parsing failed, using local extraction"
                );
                Vec::new()
            }),
            None => Vec::new(),
        };
        primary.retain(|document| !document.text.trim().is_empty());

        if !primary.is_empty() {
            if primary.iter().any(|doc| doc.metadata.page_label.is_none()) {
                let pages = self.local_pages(path).await;
                if !pages.is_empty() {
                    attribute_pages(&mut primary, &pages, self.matching);
                }
            }
            info!(
                path = %path.display(),
                documents = primary.len(),
                parser = CLOUD_PARSER,
                "extracted documents"
            );
            return Ok(primary);
        }

        let documents = pages_to_documents(self.local_pages(path).await, path);
        if documents.is_empty() {
            return Err(IngestError::NoTextExtracted(path.display().to_string()));
        }

        info!(
            path = %path.display(),
            documents = documents.len(),
            parser = LOCAL_PARSER,
            "extracted documents"
        );
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> PageMatchSettings {
        PageMatchSettings::from(&RagSettings::default())
    }

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            number,
            text: text.to_string(),
        }
    }

    fn unlabeled(text: &str) -> Document {
        Document {
            text: text.to_string(),
            metadata: Metadata::for_source("guide.pdf"),
        }
    }

    struct FixedPages(Vec<PageText>);

    impl PdfExtractor for FixedPages {
        fn extract_pages(&self, _path: &Path) -> Result<Vec<PageText>, IngestError> {
            if self.0.is_empty() {
                return Err(IngestError::PdfParse("empty".to_string()));
            }
            Ok(self.0.clone())
        }
    }

    struct FakeParser {
        documents: Vec<Document>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentParser for FakeParser {
        async fn parse(&self, _path: &Path) -> Result<Vec<Document>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServiceError::backend("parser", "boom"));
            }
            Ok(self.documents.clone())
        }
    }

    fn pdf_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("guide.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%fake").expect("write pdf");
        (dir, path)
    }

    #[test]
    fn prefix_containment_wins() {
        let pages = vec![
            page(1, "Introduction to hypertension."),
            page(2, "Beta   blockers reduce heart rate.\nThey are used after infarction."),
        ];
        let mut documents = vec![unlabeled("beta blockers reduce HEART rate.")];

        attribute_pages(&mut documents, &pages, settings());

        assert_eq!(documents[0].metadata.page_label, Some(2));
    }

    #[test]
    fn word_overlap_picks_best_page_above_threshold() {
        let pages = vec![
            page(1, "Asthma inhalers and spacer technique for children"),
            page(2, "Insulin storage, injection sites and hypoglycaemia recognition"),
        ];
        let mut documents = vec![unlabeled(
            "## Insulin\n- injection sites rotate\n- watch for hypoglycaemia",
        )];

        attribute_pages(&mut documents, &pages, settings());

        assert_eq!(documents[0].metadata.page_label, Some(2));
    }

    #[test]
    fn low_overlap_leaves_page_unset() {
        let pages = vec![page(1, "completely unrelated vocabulary here")];
        let mut documents = vec![unlabeled("renal dosing adjustments for anticoagulants")];

        attribute_pages(&mut documents, &pages, settings());

        assert_eq!(documents[0].metadata.page_label, None);
    }

    #[test]
    fn markdown_is_split_on_page_separator() {
        let documents =
            markdown_to_documents("# One\nalpha\n---\n\n---\n# Two\nbeta", Path::new("x.pdf"));

        assert_eq!(documents.len(), 2);
        assert_eq!(documents[1].text, "# Two\nbeta");
        assert_eq!(documents[0].metadata.parser.as_deref(), Some(CLOUD_PARSER));
        assert_eq!(documents[0].metadata.page_label, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cloud_output_gets_pages_from_local_text() {
        let (_dir, path) = pdf_path();
        let parser = Arc::new(FakeParser {
            documents: vec![unlabeled("Second page talks about statin myopathy risk")],
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let extractor = PageAwareExtractor::new(
            Some(parser),
            Arc::new(FixedPages(vec![
                page(1, "cover"),
                page(2, "Second page talks about statin myopathy risk in detail"),
            ])),
            settings(),
        );

        let documents = extractor.extract(&path).await.expect("extraction");

        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].metadata.page_label, Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parser_failure_falls_back_to_local_pages() {
        let (_dir, path) = pdf_path();
        let parser = Arc::new(FakeParser {
            documents: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let extractor = PageAwareExtractor::new(
            Some(parser.clone()),
            Arc::new(FixedPages(vec![page(1, "one"), page(2, "two")])),
            settings(),
        );

        let documents = extractor.extract(&path).await.expect("extraction");

        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[1].metadata.page_label, Some(2));
        assert_eq!(documents[1].metadata.parser.as_deref(), Some(LOCAL_PARSER));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_text_anywhere_is_an_error() {
        let (_dir, path) = pdf_path();
        let extractor =
            PageAwareExtractor::new(None, Arc::new(FixedPages(Vec::new())), settings());

        let result = extractor.extract(&path).await;

        assert!(matches!(result, Err(IngestError::NoTextExtracted(_))));
    }
}
