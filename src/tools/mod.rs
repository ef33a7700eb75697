pub mod firecrawl;
pub mod llm;
pub mod retry;

pub use firecrawl::{FirecrawlSearch, SearchHit, SearchProvider};
pub use llm::{
    Completion, CompletionRequest, DeltaStream, LanguageModel, OpenAiModel, StreamDelta,
    TokenUsage,
};
pub use retry::RetryPolicy;
