use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::ProviderError;
use crate::models::ChatTurn;
use crate::tools::{CompletionRequest, LanguageModel, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicPlan {
    pub topics: Vec<String>,
}

impl TopicPlan {
    pub fn to_json(&self) -> String {
        serde_json::json!({ "topics": self.topics }).to_string()
    }
}

/// Breaks a prompt into a handful of research topics.
pub struct TopicPlanner {
    llm: Arc<dyn LanguageModel>,
    system_prompt: Option<String>,
    max_topics: usize,
    retry: RetryPolicy,
}

impl TopicPlanner {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        system_prompt: Option<String>,
        max_topics: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            system_prompt,
            max_topics,
            retry,
        }
    }

    #[instrument(skip(self, history), fields(history = history.len()))]
    pub async fn plan(&self, prompt: &str, history: &[ChatTurn]) -> Result<TopicPlan, ProviderError> {
        let start_time = std::time::Instant::now();
        info!("Starting topic planning task");

        let instruction = format!(
            r#"Please generate less than {} topics to conduct deep research on the following prompt: {}
The topics should focus on gathering, analyzing, and synthesizing information from various sources.
Only return the topics, no other text, as valid JSON in the following format:
{{
    "topics": [
        "topic 1",
        "topic 2",
        "topic 3"
    ]
}}"#,
            self.max_topics, prompt
        );
        let request = CompletionRequest::new(instruction)
            .with_system(self.system_prompt.clone())
            .with_history(history.to_vec())
            .json();

        let completion = self
            .retry
            .run("topic planning", || self.llm.complete(request.clone()))
            .await?;

        let plan = parse_plan(&completion.content, self.max_topics)?;
        info!(
            "Planned {} research topics in {:?}",
            plan.topics.len(),
            start_time.elapsed()
        );
        Ok(plan)
    }
}

fn parse_plan(content: &str, max_topics: usize) -> Result<TopicPlan, ProviderError> {
    let raw: TopicPlan = serde_json::from_str(content).map_err(|e| {
        warn!("Topic plan was not valid JSON: {}", e);
        ProviderError::Parse(format!("topic plan: {}", e))
    })?;

    let topics = raw
        .topics
        .into_iter()
        .map(|topic| topic.trim().to_string())
        .filter(|topic| !topic.is_empty())
        .take(max_topics)
        .collect();
    Ok(TopicPlan { topics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plan_is_trimmed_and_capped() {
        let plan = parse_plan(
            r#"{"topics": [" History ", "", "Physics", "Applications", "Math", "Devices", "Extra"]}"#,
            5,
        )
        .unwrap();
        assert_eq!(
            plan.topics,
            vec!["History", "Physics", "Applications", "Math", "Devices"]
        );
    }

    #[test]
    fn malformed_plan_is_a_parse_error() {
        assert!(matches!(
            parse_plan("Here are your topics: 1. History", 5),
            Err(ProviderError::Parse(_))
        ));
        assert!(matches!(
            parse_plan(r#"{"subjects": []}"#, 5),
            Err(ProviderError::Parse(_))
        ));
    }

    #[test]
    fn plan_serializes_for_the_wire() {
        let plan = TopicPlan {
            topics: vec!["History".into()],
        };
        let back: TopicPlan = serde_json::from_str(&plan.to_json()).unwrap();
        assert_eq!(back, plan);
    }
}
