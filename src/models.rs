// ai-writer-service/src/models.rs

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three header labels every table view carries.
pub const TABLE_HEADERS: [&str; 3] = ["Section", "Key Points", "Image Keyword"];

pub const DEFAULT_TITLE: &str = "Untitled Document";
pub const DEFAULT_AUTHOR: &str = "AI Writer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

impl DocumentFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Xlsx => "xlsx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "pptx" => Some(DocumentFormat::Pptx),
            "xlsx" => Some(DocumentFormat::Xlsx),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// One user action, immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    pub target_language: String,
    pub requested_formats: BTreeSet<DocumentFormat>,
}

impl GenerationRequest {
    pub fn new(
        topic: impl Into<String>,
        target_language: impl Into<String>,
        requested_formats: impl IntoIterator<Item = DocumentFormat>,
    ) -> Self {
        Self {
            topic: topic.into(),
            target_language: target_language.into(),
            requested_formats: requested_formats.into_iter().collect(),
        }
    }

    pub fn requested_views(&self) -> RequestedViews {
        RequestedViews::from_formats(&self.requested_formats)
    }
}

/// Which of the three output views a request obliges the model to produce.
///
/// The document view is always required; it is the canonical view the
/// slide deck and table summarize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedViews {
    pub document: bool,
    pub slides: bool,
    pub table: bool,
}

impl RequestedViews {
    pub fn from_formats(formats: &BTreeSet<DocumentFormat>) -> Self {
        Self {
            document: true,
            slides: formats.contains(&DocumentFormat::Pptx),
            table: formats.contains(&DocumentFormat::Xlsx),
        }
    }

    pub fn all() -> Self {
        Self {
            document: true,
            slides: true,
            table: true,
        }
    }
}

/// The view a validation failure is complaining about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Document,
    Slides,
    Table,
}

impl std::fmt::Display for ViewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewKind::Document => f.write_str("document"),
            ViewKind::Slides => f.write_str("slides"),
            ViewKind::Table => f.write_str("table"),
        }
    }
}

/// The canonical intermediate representation of one generated document.
///
/// Three co-equal views derived from a single model call. Immutable once
/// constructed; enrichment produces a new value via [`with_images`].
///
/// [`with_images`]: GenerationResult::with_images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub document: DocumentView,
    pub slides: Vec<Slide>,
    pub table: TableView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentView {
    pub title: String,
    pub author: String,
    pub language: String,
    pub sections: Vec<DocSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSection {
    pub heading: String,
    pub paragraph: String,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    pub title: String,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableView {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableView {
    /// An empty table carrying the fixed 3-column header contract.
    pub fn empty() -> Self {
        Self {
            headers: TABLE_HEADERS.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }
}

/// Normalize a keyword the way the image resolver keys its cache.
pub fn normalize_keyword(keyword: &str) -> String {
    keyword.trim().to_lowercase()
}

impl GenerationResult {
    /// Every unique normalized image keyword across sections and slides.
    pub fn image_keywords(&self) -> BTreeSet<String> {
        self.document
            .sections
            .iter()
            .filter_map(|s| s.image_keyword.as_deref())
            .chain(self.slides.iter().filter_map(|s| s.image_keyword.as_deref()))
            .map(normalize_keyword)
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Attach resolved photo URLs, keyed by normalized keyword.
    ///
    /// Returns a new value; keywords absent from the map keep their URL
    /// unset. Two sections sharing a keyword receive the same URL.
    pub fn with_images(&self, urls: &HashMap<String, String>) -> Self {
        let lookup = |keyword: &Option<String>| -> Option<String> {
            keyword
                .as_deref()
                .map(normalize_keyword)
                .and_then(|k| urls.get(&k).cloned())
        };

        let mut enriched = self.clone();
        for section in &mut enriched.document.sections {
            section.resolved_image_url = lookup(&section.image_keyword);
        }
        for slide in &mut enriched.slides {
            slide.resolved_image_url = lookup(&slide.image_keyword);
        }
        enriched
    }
}

// ============================================================
// Budget
// ============================================================

/// Persisted ledger state: one calendar day of token consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub date: NaiveDate,
    pub tokens_used_today: u64,
}

/// Read-only view of the ledger for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub date: NaiveDate,
    pub tokens_used_today: u64,
    pub effective_limit: u64,
    pub remaining: u64,
}

// ============================================================
// History
// ============================================================

/// Append-only audit record of one completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub topic: String,
    pub language: String,
    pub timestamp: DateTime<Utc>,
    pub files: Vec<HistoryFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryFile {
    pub format: DocumentFormat,
    pub file_name: String,
    pub file_path: String,
    pub size_bytes: u64,
}

impl HistoryEntry {
    /// Skeleton returned by the pipeline; the renderer fills in `files`.
    pub fn skeleton(topic: &str, language: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            language: language.to_string(),
            timestamp: Utc::now(),
            files: Vec::new(),
        }
    }
}
