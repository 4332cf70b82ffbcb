//! Document loading: local PDFs and remote HTML pages.
//!
//! [`DocumentLoader::load`] turns a list of [`SourceDescriptor`]s into
//! normalized [`Document`]s. Failures are per source: a source that cannot
//! be read, fetched, or parsed is recorded in [`LoadReport::failures`] and
//! the rest of the batch proceeds.
//!
//! # PDF
//!
//! Text is extracted page by page with `lopdf`, one document per non-empty
//! page, keeping the page number in provenance. If per-page extraction
//! yields nothing, the whole file goes through `pdf-extract` and becomes a
//! single document without a page number.
//!
//! # Web
//!
//! The page is fetched with `reqwest`; boilerplate is stripped by
//! [`crate::html::extract_main_text`]. The final URL after redirects is
//! recorded as provenance.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use policy_qa_core::error::IngestionError;
use policy_qa_core::models::{Document, SourceDescriptor, SourceKind};
use policy_qa_core::text::normalize_text;

use crate::config::SourcesConfig;
use crate::html::extract_main_text;

/// Outcome of loading a batch of sources.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    pub failures: Vec<IngestionError>,
}

impl LoadReport {
    /// Number of distinct sources that produced at least one document.
    pub fn loaded_sources(&self) -> usize {
        let mut uris: Vec<&str> = self
            .documents
            .iter()
            .map(|d| d.source_uri.as_str())
            .collect();
        uris.sort_unstable();
        uris.dedup();
        uris.len()
    }
}

/// Reads PDFs from disk and fetches web pages.
pub struct DocumentLoader {
    client: reqwest::Client,
}

impl DocumentLoader {
    pub fn new(config: &SourcesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }

    /// Load every source, continuing past per-source failures.
    pub async fn load(&self, sources: &[SourceDescriptor]) -> LoadReport {
        let mut report = LoadReport::default();
        for source in sources {
            match self.load_source(source).await {
                Ok(docs) => {
                    debug!(
                        location = %source.location,
                        documents = docs.len(),
                        "loaded source"
                    );
                    report.documents.extend(docs);
                }
                Err(e) => {
                    warn!(location = %source.location, error = %e, "skipping source");
                    report.failures.push(e);
                }
            }
        }
        report
    }

    pub async fn load_source(
        &self,
        source: &SourceDescriptor,
    ) -> Result<Vec<Document>, IngestionError> {
        match source.kind {
            SourceKind::Pdf => self.load_pdf(Path::new(&source.location)).await,
            SourceKind::Web => self.load_web(&source.location).await.map(|d| vec![d]),
        }
    }

    pub async fn load_pdf(&self, path: &Path) -> Result<Vec<Document>, IngestionError> {
        let location = path.display().to_string();
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf {
            return Err(IngestionError::Unsupported {
                location,
                reason: "expected a .pdf file".to_string(),
            });
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| IngestionError::Read {
                location: location.clone(),
                reason: e.to_string(),
            })?;

        tokio::task::spawn_blocking(move || load_pdf_bytes(&location, &bytes))
            .await
            .map_err(|e| IngestionError::Parse {
                location: path.display().to_string(),
                reason: format!("extraction task failed: {}", e),
            })?
    }

    pub async fn load_web(&self, url: &str) -> Result<Document, IngestionError> {
        let fetch_err = |reason: String| IngestionError::Fetch {
            url: url.to_string(),
            reason,
        };

        let parsed = reqwest::Url::parse(url).map_err(|e| fetch_err(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(IngestionError::Unsupported {
                location: url.to_string(),
                reason: format!("unsupported URL scheme '{}'", parsed.scheme()),
            });
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {}", status)));
        }
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let page = extract_main_text(&body);
        let text = normalize_text(&page.text);
        if text.is_empty() {
            return Err(IngestionError::Empty {
                location: url.to_string(),
            });
        }

        let doc = Document::new(final_url, SourceKind::Web, None, text);
        Ok(match page.title {
            Some(title) => doc.with_title(title),
            None => doc,
        })
    }
}

/// Extract documents from in-memory PDF bytes (e.g. an uploaded file).
/// `name` becomes the source URI.
pub fn load_pdf_bytes(name: &str, bytes: &[u8]) -> Result<Vec<Document>, IngestionError> {
    let title = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string);

    let pages = match extract_pages(bytes) {
        Ok(pages) => pages,
        Err(reason) => {
            debug!(location = name, %reason, "per-page extraction failed, using whole-file fallback");
            Vec::new()
        }
    };

    let mut documents: Vec<Document> = pages
        .into_iter()
        .map(|(page, text)| Document::new(name, SourceKind::Pdf, Some(page), text))
        .collect();

    if documents.is_empty() {
        let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| IngestionError::Parse {
            location: name.to_string(),
            reason: e.to_string(),
        })?;
        let text = normalize_text(&text);
        if text.is_empty() {
            return Err(IngestionError::Empty {
                location: name.to_string(),
            });
        }
        documents.push(Document::new(name, SourceKind::Pdf, None, text));
    }

    if let Some(title) = title {
        documents = documents
            .into_iter()
            .map(|d| d.with_title(title.clone()))
            .collect();
    }
    Ok(documents)
}

/// Non-empty normalized text per page, keyed by 1-based page number.
fn extract_pages(bytes: &[u8]) -> std::result::Result<Vec<(u32, String)>, String> {
    let pdf = lopdf::Document::load_mem(bytes).map_err(|e| e.to_string())?;
    let mut pages = Vec::new();
    for page_number in pdf.get_pages().keys() {
        match pdf.extract_text(&[*page_number]) {
            Ok(raw) => {
                let text = normalize_text(&raw);
                if !text.is_empty() {
                    pages.push((*page_number, text));
                }
            }
            Err(e) => debug!(page = page_number, error = %e, "page text extraction failed"),
        }
    }
    Ok(pages)
}
