use std::sync::Arc;

use anyhow::{Context, Result};
use pro_search::config::Config;
use pro_search::store::{HistoryStore, InMemoryHistoryStore};
use pro_search::tools::{FirecrawlSearch, LanguageModel, OpenAiModel, SearchProvider};
use pro_search::{app, AppState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_with_dotenv().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pro_search=debug,tower_http=info")),
        )
        .init();

    let llm: Arc<dyn LanguageModel> =
        Arc::new(OpenAiModel::new(&config.llm).context("Failed to set up language model")?);
    let search: Arc<dyn SearchProvider> =
        Arc::new(FirecrawlSearch::new(&config.search).context("Failed to set up search")?);
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());

    if config.accounts.is_empty() {
        warn!("No accounts configured, every API call will be rejected");
    }

    let bind = config.server.bind.clone();
    let state = AppState::new(config, llm, search, history);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Pro search server running on http://{}", bind);

    axum::serve(listener, app(state)).await?;
    Ok(())
}
