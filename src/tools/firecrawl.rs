use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::SearchConfig;
use crate::error::ProviderError;

/// One hit from a web search with its scraped page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHit {
    pub url: Option<String>,
    pub title: Option<String>,
    pub markdown: Option<String>,
    pub image: Option<String>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ProviderError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FirecrawlSearchRequest<'a> {
    query: &'a str,
    limit: usize,
    timeout: u64,
    scrape_options: ScrapeOptions,
}

#[derive(Debug, Serialize)]
struct ScrapeOptions {
    formats: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlSearchResponse {
    #[serde(default)]
    data: Option<Vec<FirecrawlDocument>>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlDocument {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    metadata: Option<FirecrawlMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirecrawlMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    og_image: Option<String>,
    #[serde(default, rename = "sourceURL")]
    source_url: Option<String>,
}

impl From<FirecrawlDocument> for SearchHit {
    fn from(doc: FirecrawlDocument) -> Self {
        let metadata = doc.metadata;
        let (meta_title, image, source_url) = match metadata {
            Some(m) => (m.title, m.og_image, m.source_url),
            None => (None, None, None),
        };
        SearchHit {
            url: doc.url.or(source_url),
            title: meta_title.or(doc.title),
            markdown: doc.markdown,
            image,
        }
    }
}

/// Firecrawl `/v1/search` with markdown scraping of each hit.
pub struct FirecrawlSearch {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl FirecrawlSearch {
    pub fn new(config: &SearchConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("Firecrawl API key"));
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl SearchProvider for FirecrawlSearch {
    #[instrument(skip(self))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let request = FirecrawlSearchRequest {
            query,
            limit,
            timeout: self.timeout.as_millis() as u64,
            scrape_options: ScrapeOptions {
                formats: vec!["markdown"],
            },
        };

        let response = self
            .client
            .post(format!("{}/v1/search", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let parsed: FirecrawlSearchResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("Failed to parse response: {}", e)))?;

        let hits: Vec<SearchHit> = parsed
            .data
            .unwrap_or_default()
            .into_iter()
            .map(SearchHit::from)
            .collect();
        debug!("Search returned {} hits", hits.len());
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn documents_prefer_metadata_title_and_og_image() {
        let body = r#"{
            "success": true,
            "data": [
                {
                    "url": "https://example.com/a",
                    "title": "Plain title",
                    "markdown": "body",
                    "metadata": { "title": "Meta title", "ogImage": "https://example.com/a.png" }
                },
                { "metadata": { "sourceURL": "https://example.com/b" } }
            ]
        }"#;
        let parsed: FirecrawlSearchResponse = serde_json::from_str(body).unwrap();
        let hits: Vec<SearchHit> = parsed.data.unwrap().into_iter().map(SearchHit::from).collect();

        assert_eq!(
            hits[0],
            SearchHit {
                url: Some("https://example.com/a".into()),
                title: Some("Meta title".into()),
                markdown: Some("body".into()),
                image: Some("https://example.com/a.png".into()),
            }
        );
        assert_eq!(hits[1].url.as_deref(), Some("https://example.com/b"));
        assert_eq!(hits[1].markdown, None);
    }

    #[test]
    fn missing_data_is_empty() {
        let parsed: FirecrawlSearchResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(parsed.data.is_none());
    }

    #[test]
    fn request_uses_camel_case_scrape_options() {
        let request = FirecrawlSearchRequest {
            query: "rust",
            limit: 1,
            timeout: 15_000,
            scrape_options: ScrapeOptions {
                formats: vec!["markdown"],
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["scrapeOptions"]["formats"][0], "markdown");
        assert_eq!(value["timeout"], 15_000);
    }
}
