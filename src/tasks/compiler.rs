use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::config::ModelSpec;
use crate::error::ProviderError;
use crate::framing::Frame;
use crate::models::{ChatTurn, UsageReport};
use crate::text::TokenEstimator;
use crate::tools::{CompletionRequest, DeltaStream, LanguageModel, RetryPolicy, StreamDelta, TokenUsage};

/// Everything the final answer is written from.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub prompt: String,
    pub learnings: Vec<String>,
    pub history: Vec<ChatTurn>,
    pub model: ModelSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledReport {
    pub content: String,
    pub usage: UsageReport,
}

pub struct ReportCompiler {
    llm: Arc<dyn LanguageModel>,
    system_prompt: Option<String>,
    learnings_budget: usize,
    retry: RetryPolicy,
    estimator: TokenEstimator,
}

impl ReportCompiler {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        system_prompt: Option<String>,
        learnings_budget: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            system_prompt,
            learnings_budget,
            retry,
            estimator: TokenEstimator::default(),
        }
    }

    /// Prompt sent to the model. Without learnings this is the user's prompt as is.
    pub fn build_prompt(&self, prompt: &str, learnings: &[String]) -> String {
        if learnings.is_empty() {
            return prompt.to_string();
        }
        let joined = learnings
            .iter()
            .map(|learning| format!("<learning>\n{}\n</learning>", learning))
            .collect::<Vec<_>>()
            .join("\n");
        let learnings_text = self.estimator.trim(&joined, self.learnings_budget);

        format!(
            r#"Given the following prompt from the user, write a final report on the topic using the learnings from research. Make it as detailed as possible, aim for 3 or more pages, include ALL the learnings from research:

<prompt>{prompt}</prompt>

Here are all the learnings from previous research:

<learnings>
{learnings_text}
</learnings>"#
        )
    }

    fn completion_request(&self, request: &CompileRequest) -> CompletionRequest {
        CompletionRequest::new(self.build_prompt(&request.prompt, &request.learnings))
            .with_system(self.system_prompt.clone())
            .with_history(request.history.clone())
            .with_model(request.model.id.clone())
    }

    /// Writes the whole answer in one call.
    #[instrument(skip(self, request), fields(model = %request.model.id, learnings = request.learnings.len()))]
    pub async fn compile(&self, request: &CompileRequest) -> Result<CompiledReport, ProviderError> {
        let start_time = Instant::now();
        info!("Starting report compilation task");

        let completion_request = self.completion_request(request);
        let completion = self
            .retry
            .run("report compilation", || {
                self.llm.complete(completion_request.clone())
            })
            .await?;

        let usage = usage_report(&request.model, completion.usage, start_time);
        info!(
            "Compiled report of {} characters in {:?}",
            completion.content.len(),
            start_time.elapsed()
        );
        Ok(CompiledReport {
            content: completion.content,
            usage,
        })
    }

    /// Streams the answer as frames: one `Data` per text delta, an `Error` if
    /// the provider fails midway, and a closing `Meta` with the usage.
    #[instrument(skip(self, request), fields(model = %request.model.id, learnings = request.learnings.len()))]
    pub async fn stream(
        &self,
        request: &CompileRequest,
    ) -> Result<BoxStream<'static, Frame>, ProviderError> {
        let start_time = Instant::now();
        info!("Starting streamed report compilation task");

        let completion_request = self.completion_request(request);
        let prompt_tokens = self.estimator.estimate(&completion_request.transcript()) as u64;
        let deltas = RetryPolicy::once(self.retry.timeout)
            .run("report streaming", || {
                self.llm.stream(completion_request.clone())
            })
            .await?;

        Ok(frames(
            deltas,
            request.model.clone(),
            prompt_tokens,
            start_time,
        ))
    }
}

fn usage_report(model: &ModelSpec, usage: TokenUsage, started: Instant) -> UsageReport {
    UsageReport {
        input_token: usage.input_tokens,
        output_token: usage.output_tokens,
        output_time: started.elapsed().as_millis() as u64,
        points: model.points(usage),
    }
}

struct FrameState {
    deltas: DeltaStream,
    model: ModelSpec,
    estimator: TokenEstimator,
    prompt_tokens: u64,
    output_chars: String,
    reported: Option<TokenUsage>,
    started: Instant,
    finished: bool,
}

impl FrameState {
    fn closing_usage(&self) -> UsageReport {
        let usage = self.reported.unwrap_or_else(|| TokenUsage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.estimator.estimate(&self.output_chars) as u64,
        });
        usage_report(&self.model, usage, self.started)
    }
}

fn frames(
    deltas: DeltaStream,
    model: ModelSpec,
    prompt_tokens: u64,
    started: Instant,
) -> BoxStream<'static, Frame> {
    let state = FrameState {
        deltas,
        model,
        estimator: TokenEstimator::default(),
        prompt_tokens,
        output_chars: String::new(),
        reported: None,
        started,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.deltas.next().await {
                Some(Ok(StreamDelta::Text(text))) => {
                    state.output_chars.push_str(&text);
                    return Some((Frame::Data(text), state));
                }
                Some(Ok(StreamDelta::Usage(usage))) => {
                    debug!("Provider reported usage {:?}", usage);
                    state.reported = Some(usage);
                }
                Some(Err(err)) => {
                    warn!("Report stream failed midway: {}", err);
                    state.finished = true;
                    return Some((Frame::Error(err.to_string()), state));
                }
                None => {
                    state.finished = true;
                    let usage = state.closing_usage();
                    info!(
                        "Streamed report finished: {} output tokens in {} ms",
                        usage.output_token, usage.output_time
                    );
                    return Some((Frame::Meta(usage), state));
                }
            }
        }
    })
    .boxed()
}
