use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ImageError;
use crate::models::normalize_keyword;

pub const DEFAULT_ORIENTATION: &str = "landscape";

/// Search boundary to the stock photo API. One keyword in, at most one
/// URL out; `None` means no usable photo, which is never an error for
/// the caller.
#[async_trait]
pub trait ImageSearcher: Send + Sync {
    async fn search(&self, keyword: &str, orientation: &str)
        -> Result<Option<String>, ImageError>;
}

/// Resolve every unique keyword to a photo URL, best effort.
///
/// Keywords are normalized and de-duplicated before dispatch, so two
/// sections sharing a keyword cost one search and share one URL. Lookups
/// run concurrently up to `max_concurrent`; a failure resolves to no
/// entry for that keyword only. The returned map is the per-generation
/// cache; nothing survives across requests.
pub async fn resolve_keywords<I>(
    searcher: &dyn ImageSearcher,
    keywords: I,
    max_concurrent: usize,
) -> HashMap<String, String>
where
    I: IntoIterator<Item = String>,
{
    let unique: std::collections::BTreeSet<String> = keywords
        .into_iter()
        .map(|k| normalize_keyword(&k))
        .filter(|k| !k.is_empty())
        .collect();

    stream::iter(unique)
        .map(|keyword| async move {
            match searcher.search(&keyword, DEFAULT_ORIENTATION).await {
                Ok(Some(url)) => {
                    debug!(keyword = %keyword, "Resolved image keyword");
                    Some((keyword, url))
                }
                Ok(None) => {
                    debug!(keyword = %keyword, "No photo found for keyword");
                    None
                }
                Err(e) => {
                    warn!(keyword = %keyword, error = %e, "Image lookup failed, leaving keyword unresolved");
                    None
                }
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .filter_map(|resolved| async move { resolved })
        .collect()
        .await
}

// ============================================================
// Wire format
// ============================================================

#[derive(Debug, Deserialize)]
struct PhotoSearchResponse {
    #[serde(default)]
    photos: Vec<Photo>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    src: PhotoSrc,
}

#[derive(Debug, Deserialize, Default)]
struct PhotoSrc {
    small: Option<String>,
    medium: Option<String>,
    large: Option<String>,
}

impl PhotoSrc {
    /// Medium if present, else large, else small.
    fn preferred(self) -> Option<String> {
        self.medium.or(self.large).or(self.small)
    }
}

// ============================================================
// HTTP client
// ============================================================

pub struct PexelsClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl PexelsClient {
    pub fn new(api_url: String, api_key: String, timeout: Duration) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImageError::Request(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            api_key,
        })
    }
}

#[async_trait]
impl ImageSearcher for PexelsClient {
    async fn search(
        &self,
        keyword: &str,
        orientation: &str,
    ) -> Result<Option<String>, ImageError> {
        let response = self
            .client
            .get(&self.api_url)
            .header("Authorization", &self.api_key)
            .query(&[
                ("query", keyword),
                ("per_page", "1"),
                ("orientation", orientation),
            ])
            .send()
            .await
            .map_err(|e| ImageError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Status(status.as_u16()));
        }

        let body: PhotoSearchResponse = response
            .json()
            .await
            .map_err(|e| ImageError::Malformed(e.to_string()))?;

        Ok(body.photos.into_iter().next().and_then(|p| p.src.preferred()))
    }
}

// ============================================================
// Fake searcher
// ============================================================

/// Scripted searcher for tests: keyword → URL, or a scripted failure.
/// Call counts per keyword make de-duplication observable.
#[derive(Default)]
pub struct FakeImageSearcher {
    urls: HashMap<String, String>,
    failing: std::collections::HashSet<String>,
    calls: std::sync::Mutex<HashMap<String, usize>>,
}

impl FakeImageSearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, keyword: &str, url: &str) -> Self {
        self.urls
            .insert(normalize_keyword(keyword), url.to_string());
        self
    }

    pub fn with_failure(mut self, keyword: &str) -> Self {
        self.failing.insert(normalize_keyword(keyword));
        self
    }

    pub fn calls_for(&self, keyword: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&normalize_keyword(keyword))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ImageSearcher for FakeImageSearcher {
    async fn search(
        &self,
        keyword: &str,
        _orientation: &str,
    ) -> Result<Option<String>, ImageError> {
        let key = normalize_keyword(keyword);
        *self.calls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        if self.failing.contains(&key) {
            return Err(ImageError::Status(503));
        }
        Ok(self.urls.get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_preference_order() {
        let full = PhotoSrc {
            small: Some("s".into()),
            medium: Some("m".into()),
            large: Some("l".into()),
        };
        assert_eq!(full.preferred().as_deref(), Some("m"));

        let no_medium = PhotoSrc {
            small: Some("s".into()),
            medium: None,
            large: Some("l".into()),
        };
        assert_eq!(no_medium.preferred().as_deref(), Some("l"));

        let only_small = PhotoSrc {
            small: Some("s".into()),
            ..Default::default()
        };
        assert_eq!(only_small.preferred().as_deref(), Some("s"));

        assert_eq!(PhotoSrc::default().preferred(), None);
    }

    #[test]
    fn test_empty_photos_decodes_to_none() {
        let body: PhotoSearchResponse = serde_json::from_str(r#"{"photos": []}"#).unwrap();
        assert!(body.photos.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_keywords_cost_one_call() {
        let searcher = FakeImageSearcher::new().with_url("ocean", "https://img/ocean.jpg");

        let resolved = resolve_keywords(
            &searcher,
            vec![
                "ocean".to_string(),
                "  Ocean ".to_string(),
                "OCEAN".to_string(),
            ],
            4,
        )
        .await;

        assert_eq!(searcher.calls_for("ocean"), 1);
        assert_eq!(resolved.get("ocean").map(String::as_str), Some("https://img/ocean.jpg"));
    }

    #[tokio::test]
    async fn test_partial_failure_isolated_per_keyword() {
        let searcher = FakeImageSearcher::new()
            .with_url("ocean", "https://img/ocean.jpg")
            .with_failure("mountains");

        let resolved = resolve_keywords(
            &searcher,
            vec!["mountains".to_string(), "ocean".to_string()],
            4,
        )
        .await;

        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key("ocean"));
        assert!(!resolved.contains_key("mountains"));
    }

    #[tokio::test]
    async fn test_blank_keywords_never_dispatched() {
        let searcher = FakeImageSearcher::new();
        let resolved =
            resolve_keywords(&searcher, vec!["   ".to_string(), String::new()], 4).await;
        assert!(resolved.is_empty());
        assert_eq!(searcher.total_calls(), 0);
    }
}
