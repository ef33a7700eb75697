mod generate;
mod history;
mod research;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::config::{Config, ModelSpec};
use crate::error::ApiError;
use crate::models::ChatTurn;
use crate::research::ResearchOrchestrator;
use crate::store::{AccountStore, HistoryStore};
use crate::tasks::{ReportCompiler, ResourceAnalyzer, ResourceSearcher, TopicPlanner};
use crate::tools::{LanguageModel, SearchProvider};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub accounts: Arc<AccountStore>,
    pub history: Arc<dyn HistoryStore>,
    pub orchestrator: Arc<ResearchOrchestrator>,
}

impl AppState {
    pub fn new(
        config: Config,
        llm: Arc<dyn LanguageModel>,
        search: Arc<dyn SearchProvider>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let retry = config.llm.retry_policy();
        let research = &config.research;

        let orchestrator = ResearchOrchestrator::new(
            TopicPlanner::new(
                llm.clone(),
                config.llm.system_prompt.clone(),
                research.max_topics,
                retry,
            ),
            ResourceSearcher::new(
                llm.clone(),
                search,
                retry,
                Duration::from_secs(config.search.timeout_secs),
                config.search.result_limit,
                config.search.max_queries,
                config.search.content_token_cap,
            ),
            ResourceAnalyzer::new(llm.clone(), research.max_learnings, retry),
            ReportCompiler::new(
                llm,
                config.llm.system_prompt.clone(),
                research.learnings_token_budget,
                retry,
            ),
        );

        Self {
            accounts: Arc::new(AccountStore::from_seeds(&config.accounts, Utc::now())),
            history,
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(config),
        }
    }

    /// Catalogue entry for `id`, or the default model when `id` is blank.
    /// Ids missing from the catalogue have no price and are refused.
    fn model_spec(&self, id: Option<&str>) -> Result<ModelSpec, ApiError> {
        match id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self
                .config
                .model(id)
                .cloned()
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown model {}", id))),
            None => Ok(self.config.default_model()),
        }
    }

    /// The most recent turns forwarded to the model as context.
    fn recent_turns(&self, chat_log: &[ChatTurn]) -> Vec<ChatTurn> {
        let keep = self.config.research.history_turns;
        chat_log[chat_log.len().saturating_sub(keep)..].to_vec()
    }
}

/// Account resolved from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub email: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        let account = state
            .accounts
            .authenticate(token)
            .ok_or(ApiError::Unauthorized)?;
        debug!("Authenticated {}", account.email);
        Ok(AuthUser {
            email: account.email,
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/chat/generateResearchSteps",
            post(research::generate_research_steps),
        )
        .route("/api/chat/searchingResources", post(research::searching_resources))
        .route("/api/chat/analyzingResources", post(research::analyzing_resources))
        .route("/api/chat/generateText", post(generate::generate_text))
        .route(
            "/api/chat/history",
            get(history::list_sessions)
                .post(history::append_entry)
                .put(history::rename_session)
                .delete(history::delete_session),
        )
        .route("/api/chat/log", get(history::session_log))
        .route("/api/research", post(research::run_research))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}
