use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::{AppState, AuthUser};
use crate::error::ApiError;
use crate::framing::{self, Frame, FrameCodec};
use crate::models::{ChatLogEntry, ChatTurn, ChatType, FastAnswerResponse};
use crate::tasks::CompileRequest;

const GENERATION_FAILED: &str = "Error generating text.";
const STREAM_BUFFER: usize = 32;

/// Fields of the chat form. JSON-valued fields arrive as strings.
#[derive(Debug, Default)]
struct GenerateForm {
    prompt: String,
    session_id: String,
    chat_log: Vec<ChatTurn>,
    regenerate: bool,
    learnings: Vec<String>,
    file_urls: Vec<String>,
    model: Option<String>,
    chat_mode: u8,
    model_type: String,
}

fn json_field<T: DeserializeOwned + Default>(name: &str, value: &str) -> Result<T, ApiError> {
    if value.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(value)
        .map_err(|e| ApiError::BadRequest(format!("Field {} is not valid JSON: {}", name, e)))
}

async fn read_form(mut multipart: Multipart) -> Result<GenerateForm, ApiError> {
    let mut form = GenerateForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let value = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        match name.as_str() {
            "prompt" => form.prompt = value,
            "sessionId" => form.session_id = value,
            "chatLog" => form.chat_log = json_field(&name, &value)?,
            "reGenerate" => form.regenerate = value.trim() == "true",
            "learnings" => form.learnings = json_field(&name, &value)?,
            "fileUrls" => form.file_urls = json_field(&name, &value)?,
            "model" => form.model = Some(value),
            "chatMode" => {
                let value = value.trim();
                form.chat_mode = if value.is_empty() {
                    0
                } else {
                    value
                        .parse()
                        .map_err(|_| ApiError::BadRequest(format!("Invalid chatMode {}", value)))?
                };
            }
            "modelType" => form.model_type = value,
            other => debug!("Ignoring form field {}", other),
        }
    }

    if form.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt is required".to_string()));
    }
    if form.session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("sessionId is required".to_string()));
    }
    Ok(form)
}

#[instrument(skip(state, multipart), fields(user = %user.email))]
pub async fn generate_text(
    State(state): State<AppState>,
    user: AuthUser,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_form(multipart).await?;
    let model = state.model_spec(form.model.as_deref())?;
    let now = Utc::now();
    state.accounts.check_generation(&user.email, &model.id, now)?;

    let chat_type = ChatType::classify(&form.model_type, form.chat_mode, !form.learnings.is_empty());
    if matches!(chat_type, ChatType::Image | ChatType::Audio) {
        return Err(ApiError::BadRequest(
            "Image and audio generation are not available".to_string(),
        ));
    }
    info!("Generating {:?} answer with {}", chat_type, model.id);

    let timestamp = turn_timestamp(&state, &user.email, &form, now).await;
    let mut pending = ChatLogEntry::pending(&form.prompt, chat_type, &model.id, timestamp);
    pending.file_urls = form.file_urls.clone();
    state
        .history
        .append(&user.email, &form.session_id, pending.clone())
        .await?;

    let turn = Turn {
        state: state.clone(),
        email: user.email,
        session_id: form.session_id.clone(),
        pending,
    };
    let request = CompileRequest {
        history: state.recent_turns(&form.chat_log),
        prompt: form.prompt,
        learnings: form.learnings,
        model,
    };

    if chat_type.is_streamed() {
        stream_answer(turn, request).await
    } else {
        fast_answer(turn, request).await
    }
}

/// A regenerated answer takes over the session's last entry when it is for
/// the same prompt.
async fn turn_timestamp(
    state: &AppState,
    email: &str,
    form: &GenerateForm,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if !form.regenerate {
        return now;
    }
    match state.history.log(email, &form.session_id).await {
        Ok(chats) => chats
            .last()
            .filter(|last| last.prompt == form.prompt)
            .map(|last| last.timestamp)
            .unwrap_or(now),
        Err(_) => now,
    }
}

/// The history entry for one generation and where it belongs.
struct Turn {
    state: AppState,
    email: String,
    session_id: String,
    pending: ChatLogEntry,
}

impl Turn {
    async fn record(&self, entry: ChatLogEntry) {
        if let Err(err) = self
            .state
            .history
            .append(&self.email, &self.session_id, entry)
            .await
        {
            error!("Failed to record answer: {}", err);
        }
    }
}

async fn fast_answer(turn: Turn, request: CompileRequest) -> Result<Response, ApiError> {
    let report = match turn.state.orchestrator.compiler().compile(&request).await {
        Ok(report) => report,
        Err(err) => {
            turn.record(turn.pending.resolved(GENERATION_FAILED, None)).await;
            return Err(err.into());
        }
    };

    turn.state
        .accounts
        .charge(&turn.email, report.usage.points, Utc::now());
    turn.record(turn.pending.resolved(report.content.clone(), Some(report.usage)))
        .await;

    Ok(Json(FastAnswerResponse {
        content: report.content,
        success: true,
        input_token: report.usage.input_token,
        output_token: report.usage.output_token,
        points: report.usage.points,
    })
    .into_response())
}

async fn stream_answer(turn: Turn, request: CompileRequest) -> Result<Response, ApiError> {
    let frames = match turn.state.orchestrator.compiler().stream(&request).await {
        Ok(frames) => frames,
        Err(err) => {
            turn.record(turn.pending.resolved(GENERATION_FAILED, None)).await;
            return Err(err.into());
        }
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(STREAM_BUFFER);
    tokio::spawn(relay(turn, frames, tx));

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Ok((
        [
            (header::CONTENT_TYPE, framing::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

/// Forwards encoded frames to the client and records the finished answer.
/// Generation runs to the end even if the client goes away.
async fn relay(
    turn: Turn,
    mut frames: BoxStream<'static, Frame>,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let mut answer = String::new();
    let mut usage = None;
    let mut failure = None;
    let mut client_gone = false;

    while let Some(frame) = frames.next().await {
        match &frame {
            Frame::Data(text) => answer.push_str(text),
            Frame::Meta(report) => usage = Some(*report),
            Frame::Error(message) => failure = Some(message.clone()),
        }
        if client_gone {
            continue;
        }
        match FrameCodec::encode_to_bytes(frame) {
            Ok(bytes) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    warn!("Client disconnected, finishing answer in the background");
                    client_gone = true;
                }
            }
            Err(err) => error!("Failed to encode frame: {}", err),
        }
    }

    if let Some(report) = usage {
        turn.state
            .accounts
            .charge(&turn.email, report.points, Utc::now());
    }
    let response = match failure {
        Some(message) if answer.is_empty() => {
            warn!("Answer stream failed before any text: {}", message);
            GENERATION_FAILED.to_string()
        }
        _ => answer,
    };
    turn.record(turn.pending.resolved(response, usage)).await;
    // The body ends only after the history entry is final.
    drop(tx);
}
