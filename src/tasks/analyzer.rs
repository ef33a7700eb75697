use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::models::Source;
use crate::tools::{CompletionRequest, LanguageModel, RetryPolicy};

/// Learnings for one topic. `fallback` is set when they are the raw source
/// contents rather than model output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub learnings: Vec<String>,
    pub fallback: bool,
}

#[derive(Debug, Deserialize)]
struct LearningList {
    #[serde(default)]
    learnings: Vec<String>,
}

pub struct ResourceAnalyzer {
    llm: Arc<dyn LanguageModel>,
    max_learnings: usize,
    retry: RetryPolicy,
}

impl ResourceAnalyzer {
    pub fn new(llm: Arc<dyn LanguageModel>, max_learnings: usize, retry: RetryPolicy) -> Self {
        Self {
            llm,
            max_learnings,
            retry,
        }
    }

    /// Compresses a topic's sources into a few dense learnings. Never fails:
    /// when the model errors or returns nothing, each source's content is
    /// passed through as a learning, in source order.
    #[instrument(skip(self, sources), fields(sources = sources.len()))]
    pub async fn analyze(&self, title: &str, sources: &[Source]) -> Analysis {
        let start_time = std::time::Instant::now();
        info!("Starting resource analysis task");

        let learnings = match self.summarize(title, sources).await {
            Ok(learnings) => learnings,
            Err(reason) => {
                warn!("Analysis for {:?} fell back to source contents: {}", title, reason);
                Vec::new()
            }
        };

        let analysis = if learnings.is_empty() {
            Analysis {
                learnings: sources.iter().map(|s| s.content.clone()).collect(),
                fallback: true,
            }
        } else {
            Analysis {
                learnings,
                fallback: false,
            }
        };

        info!(
            "Produced {} learnings (fallback: {}) in {:?}",
            analysis.learnings.len(),
            analysis.fallback,
            start_time.elapsed()
        );
        analysis
    }

    async fn summarize(&self, title: &str, sources: &[Source]) -> Result<Vec<String>, String> {
        let contents = sources
            .iter()
            .map(|source| format!("<content>\n{}\n</content>", source.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"Given the following contents from this topic <topic>{title}</topic>, generate a list of learnings from the contents.

<contents>{contents}</contents>

Return a maximum of {max} learnings, but feel free to return less if the contents are clear. Make sure each learning is unique and not similar to each other. The learnings should be concise and to the point, as detailed and information dense as possible. Make sure to include any entities like people, places, companies, products, things, etc in the learnings, as well as any exact metrics, numbers, or dates. The learnings will be used to research the topic further.
Return the learnings as a JSON object in the following format:
{{
    "learnings": [
        "learning1",
        "learning2",
        "learning3"
    ]
}}"#,
            max = self.max_learnings,
        );
        let request = CompletionRequest::new(prompt).json();

        let completion = self
            .retry
            .run("resource analysis", || self.llm.complete(request.clone()))
            .await
            .map_err(|e| e.to_string())?;

        let parsed: LearningList =
            serde_json::from_str(&completion.content).map_err(|e| format!("bad JSON: {e}"))?;

        let mut learnings: Vec<String> = Vec::new();
        for learning in parsed.learnings {
            let learning = learning.trim().to_string();
            if !learning.is_empty() && !learnings.contains(&learning) {
                learnings.push(learning);
            }
        }
        learnings.truncate(self.max_learnings);
        Ok(learnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::tools::{Completion, DeltaStream, TokenUsage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Canned(Result<&'static str, ProviderError>);

    #[async_trait]
    impl LanguageModel for Canned {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ProviderError> {
            self.0.clone().map(|content| Completion {
                content: content.to_string(),
                usage: TokenUsage::default(),
            })
        }

        async fn stream(&self, _request: CompletionRequest) -> Result<DeltaStream, ProviderError> {
            Err(ProviderError::NotConfigured("stream"))
        }
    }

    fn analyzer(reply: Result<&'static str, ProviderError>) -> ResourceAnalyzer {
        ResourceAnalyzer::new(
            Arc::new(Canned(reply)),
            3,
            RetryPolicy::once(Duration::from_secs(1)),
        )
    }

    fn sources() -> Vec<Source> {
        ["first page", "second page"]
            .into_iter()
            .enumerate()
            .map(|(i, content)| Source {
                url: format!("https://example.com/{i}"),
                content: content.to_string(),
                ..Source::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn model_learnings_are_capped() {
        let analysis = analyzer(Ok(r#"{"learnings": ["a", "b", "a", "c", "d"]}"#))
            .analyze("topic", &sources())
            .await;
        assert_eq!(analysis.learnings, vec!["a", "b", "c"]);
        assert!(!analysis.fallback);
    }

    #[tokio::test]
    async fn empty_learnings_pass_sources_through_in_order() {
        let analysis = analyzer(Ok(r#"{"learnings": []}"#))
            .analyze("topic", &sources())
            .await;
        assert_eq!(analysis.learnings, vec!["first page", "second page"]);
        assert!(analysis.fallback);
    }

    #[tokio::test]
    async fn provider_failure_and_bad_json_fall_back() {
        let failed = analyzer(Err(ProviderError::Timeout))
            .analyze("topic", &sources())
            .await;
        assert_eq!(failed.learnings.len(), 2);
        assert!(failed.fallback);

        let garbled = analyzer(Ok("learnings: one, two")).analyze("topic", &sources()).await;
        assert!(garbled.fallback);
    }

    #[tokio::test]
    async fn no_sources_means_no_learnings() {
        let analysis = analyzer(Ok(r#"{"learnings": []}"#)).analyze("topic", &[]).await;
        assert!(analysis.learnings.is_empty());
    }
}
