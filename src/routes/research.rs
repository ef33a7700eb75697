use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{AppState, AuthUser};
use crate::error::ApiError;
use crate::models::{
    AnalyzeRequest, AnalyzeResponse, ChatLogEntry, ChatType, ResearchRequest,
    ResearchStepsRequest, ResearchStepsResponse, SearchRequest,
};
use crate::research::{Phase, ResearchJob, ResearchRun};
use crate::store::ResearchReservation;
use crate::tasks::SearchBatch;

const ABANDONED: &str = "Research was abandoned before it finished.";

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchBatch>,
}

#[instrument(skip(state, req), fields(user = %user.email))]
pub async fn generate_research_steps(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ResearchStepsRequest>,
) -> Result<Json<ResearchStepsResponse>, ApiError> {
    let reservation =
        state
            .accounts
            .reserve_research(&user.email, &state.config.research.credits, Utc::now())?;

    let history = state.recent_turns(&req.chat_log);
    match state.orchestrator.planner().plan(&req.prompt, &history).await {
        Ok(plan) => {
            if plan.topics.is_empty() {
                state.accounts.release_research(&reservation);
            }
            Ok(Json(ResearchStepsResponse {
                topics: plan.to_json(),
            }))
        }
        Err(err) => {
            state.accounts.release_research(&reservation);
            Err(err.into())
        }
    }
}

#[instrument(skip(state, req), fields(user = %user.email, title = %req.title))]
pub async fn searching_resources(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<SearchRequest>,
) -> Json<SearchResponse> {
    let results = state.orchestrator.searcher().search(&req.title).await;
    Json(SearchResponse { results })
}

#[instrument(skip(state, req), fields(user = %user.email, title = %req.title))]
pub async fn analyzing_resources(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<AnalyzeRequest>,
) -> Json<AnalyzeResponse> {
    let analysis = state
        .orchestrator
        .analyzer()
        .analyze(&req.title, &req.sources)
        .await;
    Json(AnalyzeResponse {
        learning_datas: analysis.learnings,
    })
}

/// Runs a whole research job server-side and streams `run` snapshots until
/// the terminal one. The outcome lands in the session history.
#[instrument(skip(state, req), fields(user = %user.email))]
pub async fn run_research(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ResearchRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let model = state.model_spec(req.model.as_deref())?;
    let reservation =
        state
            .accounts
            .reserve_research(&user.email, &state.config.research.credits, Utc::now())?;

    let job = ResearchJob {
        prompt: req.prompt.clone(),
        history: state.recent_turns(&req.chat_log),
        model,
    };
    let session_id = req
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let pending = ChatLogEntry::pending(&req.prompt, ChatType::Research, &job.model.id, Utc::now());
    if let Err(err) = state
        .history
        .append(&user.email, &session_id, pending.clone())
        .await
    {
        state.accounts.release_research(&reservation);
        return Err(err.into());
    }

    info!("Research run started in session {}", session_id);

    let (updates, snapshots_rx) = watch::channel(ResearchRun::new(req.prompt.clone()));
    let announce = SseEvent::default().event("session").data(session_id.clone());
    tokio::spawn(async move {
        let run = state.orchestrator.run(&job, &updates).await;
        record_outcome(&state, &user.email, &session_id, &reservation, pending, &run).await;
        // Subscribers see the stream end only once history is written.
        drop(updates);
    });

    let events =
        stream::once(async move { Ok::<_, Infallible>(announce) }).chain(snapshots(snapshots_rx));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn record_outcome(
    state: &AppState,
    email: &str,
    session_id: &str,
    reservation: &ResearchReservation,
    pending: ChatLogEntry,
    run: &ResearchRun,
) {
    if run.topics.is_empty() || run.phase == Phase::Abandoned {
        info!("Research did not run to completion, releasing quota");
        state.accounts.release_research(reservation);
    }

    let entry = match &run.phase {
        Phase::Done => {
            if let Some(usage) = run.usage {
                state.accounts.charge(email, usage.points, Utc::now());
            }
            pending.resolved(run.answer.clone(), run.usage)
        }
        Phase::Failed(reason) => pending.resolved(reason.clone(), None),
        Phase::Abandoned => pending.resolved(ABANDONED, None),
        other => {
            warn!("Research run stopped in non-terminal phase {:?}", other);
            pending.resolved("Research stopped unexpectedly", None)
        }
    };

    if let Err(err) = state.history.append(email, session_id, entry).await {
        error!("Failed to record research result: {}", err);
    }
}

fn snapshots(
    updates: watch::Receiver<ResearchRun>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold((updates, true), |(mut updates, first)| async move {
        if !first && updates.changed().await.is_err() {
            return None;
        }
        let run = updates.borrow_and_update().clone();
        let event = SseEvent::default()
            .event("run")
            .json_data(&run)
            .unwrap_or_else(|err| {
                warn!("Failed to encode research snapshot: {}", err);
                SseEvent::default().event("error").data(err.to_string())
            });
        Some((Ok(event), (updates, false)))
    })
}
