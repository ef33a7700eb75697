use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::models::Source;
use crate::text::TokenEstimator;
use crate::tools::{CompletionRequest, LanguageModel, RetryPolicy, SearchHit, SearchProvider};

/// Results of one search query as parallel arrays, missing fields dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchBatch {
    pub urls: Vec<String>,
    pub contents: Vec<String>,
    pub images: Vec<String>,
    pub titles: Vec<String>,
}

impl SearchBatch {
    fn from_hits(hits: Vec<SearchHit>) -> Self {
        let mut batch = Self::default();
        for hit in hits {
            batch.urls.extend(hit.url);
            batch.contents.extend(hit.markdown);
            batch.images.extend(hit.image);
            batch.titles.extend(hit.title);
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// One source per hit that has a URL, in query order. Title, image and
/// content stay with the hit they came from.
pub fn sources_from_hits(hits: &[Vec<SearchHit>]) -> Vec<Source> {
    hits.iter()
        .flatten()
        .filter_map(|hit| {
            Some(Source {
                url: hit.url.clone()?,
                title: hit.title.clone(),
                image: hit.image.clone(),
                content: hit.markdown.clone().unwrap_or_default(),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct QueryPlan {
    queries: Vec<String>,
}

pub struct ResourceSearcher {
    llm: Arc<dyn LanguageModel>,
    search: Arc<dyn SearchProvider>,
    retry: RetryPolicy,
    search_timeout: Duration,
    result_limit: usize,
    max_queries: usize,
    content_token_cap: usize,
    estimator: TokenEstimator,
}

impl ResourceSearcher {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        search: Arc<dyn SearchProvider>,
        retry: RetryPolicy,
        search_timeout: Duration,
        result_limit: usize,
        max_queries: usize,
        content_token_cap: usize,
    ) -> Self {
        Self {
            llm,
            search,
            retry,
            search_timeout,
            result_limit,
            max_queries,
            content_token_cap,
            estimator: TokenEstimator::default(),
        }
    }

    /// Searches the web for a topic in the compact wire shape.
    pub async fn search(&self, title: &str) -> Vec<SearchBatch> {
        self.search_hits(title)
            .await
            .into_iter()
            .map(SearchBatch::from_hits)
            .collect()
    }

    /// Hits of every generated query, in query order. Never fails: any query
    /// that errors or times out contributes no hits.
    #[instrument(skip(self))]
    pub async fn search_hits(&self, title: &str) -> Vec<Vec<SearchHit>> {
        let start_time = std::time::Instant::now();
        info!("Starting resource search task");

        let queries = self.generate_queries(title).await;
        let hits = join_all(queries.iter().map(|query| self.run_query(query))).await;

        info!(
            "Searched {} queries, {} returned results, in {:?}",
            queries.len(),
            hits.iter().filter(|h| !h.is_empty()).count(),
            start_time.elapsed()
        );
        hits
    }

    pub async fn generate_queries(&self, title: &str) -> Vec<String> {
        let prompt = format!(
            r#"Given the following prompt from the user, generate a list of SERP queries to research the topic.
Return a maximum of {} queries, but feel free to return less if the original prompt is clear. Make sure each query is unique and not similar to each other.
Prompt: {}
Return the queries in a JSON format like this: {{"queries": ["query1", "query2"]}}"#,
            self.max_queries, title
        );
        let request = CompletionRequest::new(prompt).json();

        let completion = match self
            .retry
            .run("search query generation", || self.llm.complete(request.clone()))
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                warn!("Search query generation failed: {}", err);
                return Vec::new();
            }
        };

        match serde_json::from_str::<QueryPlan>(&completion.content) {
            Ok(plan) => {
                let mut queries: Vec<String> = Vec::new();
                for query in plan.queries {
                    let query = query.trim().to_string();
                    if !query.is_empty() && !queries.contains(&query) {
                        queries.push(query);
                    }
                }
                queries.truncate(self.max_queries);
                queries
            }
            Err(err) => {
                warn!("Search queries were not valid JSON: {}", err);
                Vec::new()
            }
        }
    }

    async fn run_query(&self, query: &str) -> Vec<SearchHit> {
        let result =
            tokio::time::timeout(self.search_timeout, self.search.search(query, self.result_limit))
                .await;
        match result {
            Ok(Ok(hits)) => hits
                .into_iter()
                .map(|hit| SearchHit {
                    markdown: hit
                        .markdown
                        .map(|md| self.estimator.trim(&md, self.content_token_cap)),
                    ..hit
                })
                .collect(),
            Ok(Err(err)) => {
                warn!("Search for {:?} failed: {}", query, err);
                Vec::new()
            }
            Err(_) => {
                warn!("Search for {:?} timed out after {:?}", query, self.search_timeout);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::tools::{Completion, DeltaStream, TokenUsage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct CannedQueries(&'static str);

    #[async_trait]
    impl LanguageModel for CannedQueries {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ProviderError> {
            Ok(Completion {
                content: self.0.to_string(),
                usage: TokenUsage::default(),
            })
        }

        async fn stream(&self, _request: CompletionRequest) -> Result<DeltaStream, ProviderError> {
            Err(ProviderError::NotConfigured("stream"))
        }
    }

    struct ScriptedSearch;

    #[async_trait]
    impl SearchProvider for ScriptedSearch {
        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchHit>, ProviderError> {
            match query {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Vec::new())
                }
                "broken" => Err(ProviderError::Status {
                    code: 500,
                    body: "oops".into(),
                }),
                other => Ok(vec![SearchHit {
                    url: Some(format!("https://example.com/{other}")),
                    title: Some(format!("About {other}")),
                    markdown: Some(format!("{other} content")),
                    image: None,
                }]),
            }
        }
    }

    fn searcher(queries: &'static str) -> ResourceSearcher {
        ResourceSearcher::new(
            Arc::new(CannedQueries(queries)),
            Arc::new(ScriptedSearch),
            RetryPolicy::once(Duration::from_secs(1)),
            Duration::from_millis(50),
            1,
            2,
            25_000,
        )
    }

    #[tokio::test]
    async fn slow_query_contributes_nothing_but_does_not_block() {
        let batches = searcher(r#"{"queries": ["slow", "fast"]}"#).search("topic").await;
        assert_eq!(batches.len(), 2);
        assert!(batches[0].is_empty());
        assert_eq!(batches[1].urls, vec!["https://example.com/fast"]);
        assert_eq!(batches[1].contents, vec!["fast content"]);
    }

    #[tokio::test]
    async fn failing_query_is_isolated() {
        let hits = searcher(r#"{"queries": ["broken", "ok"]}"#)
            .search_hits("topic")
            .await;
        assert_eq!(sources_from_hits(&hits).len(), 1);
    }

    #[test]
    fn sources_keep_fields_of_their_own_hit() {
        let hits = vec![vec![
            SearchHit {
                url: Some("https://a".into()),
                title: None,
                markdown: None,
                image: None,
            },
            SearchHit {
                url: Some("https://b".into()),
                title: Some("B".into()),
                markdown: Some("B page".into()),
                image: None,
            },
            SearchHit {
                url: None,
                title: Some("orphan".into()),
                markdown: Some("orphan page".into()),
                image: None,
            },
        ]];

        let sources = sources_from_hits(&hits);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].url, "https://a");
        assert_eq!(sources[0].title, None);
        assert_eq!(sources[0].content, "");
        assert_eq!(sources[1].url, "https://b");
        assert_eq!(sources[1].title.as_deref(), Some("B"));
        assert_eq!(sources[1].content, "B page");
    }

    #[tokio::test]
    async fn queries_are_deduplicated_and_capped() {
        let queries = searcher(r#"{"queries": ["a", "a", " b ", "c"]}"#)
            .generate_queries("topic")
            .await;
        assert_eq!(queries, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn malformed_query_plan_yields_no_sources() {
        let batches = searcher("no json here").search("topic").await;
        assert!(batches.is_empty());
    }

    #[test]
    fn missing_fields_are_compacted() {
        let batch = SearchBatch::from_hits(
            vec![
                SearchHit {
                    url: Some("https://a".into()),
                    title: None,
                    markdown: Some("A".into()),
                    image: Some("https://a.png".into()),
                },
                SearchHit::default(),
            ],
        );
        assert_eq!(batch.urls, vec!["https://a"]);
        assert!(batch.titles.is_empty());
        assert_eq!(batch.images, vec!["https://a.png"]);
    }
}
