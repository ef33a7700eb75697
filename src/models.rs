use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One scraped search result attached to a research topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Progress,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(rename = "researchStep")]
    pub message: String,
}

impl StepEvent {
    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Progress,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Failure,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchTopic {
    pub title: String,
    pub research_steps: Vec<StepEvent>,
    pub sources: Vec<Source>,
    pub learnings: Vec<String>,
}

impl ResearchTopic {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Token counts and cost reported at the end of a generated answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub input_token: u64,
    pub output_token: u64,
    /// Milliseconds spent generating.
    pub output_time: u64,
    pub points: f64,
}

/// Integer tag persisted with every chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChatType {
    Plain = 0,
    Research = 1,
    Fast = 2,
    Image = 3,
    Audio = 4,
}

impl ChatType {
    /// Classifies a generation request the way the chat form submits it.
    pub fn classify(model_type: &str, chat_mode: u8, has_learnings: bool) -> Self {
        match model_type {
            "image" => Self::Image,
            "audio" => Self::Audio,
            _ if chat_mode == 1 => Self::Fast,
            _ if has_learnings => Self::Research,
            _ => Self::Plain,
        }
    }

    pub fn is_streamed(self) -> bool {
        matches!(self, Self::Plain | Self::Research)
    }
}

impl From<ChatType> for u8 {
    fn from(value: ChatType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ChatType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Research),
            2 => Ok(Self::Fast),
            3 => Ok(Self::Image),
            4 => Ok(Self::Audio),
            other => Err(format!("unknown chat type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLogEntry {
    pub prompt: String,
    pub response: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub chat_type: ChatType,
    #[serde(default)]
    pub input_token: u64,
    #[serde(default)]
    pub output_token: u64,
    #[serde(default)]
    pub output_time: u64,
    #[serde(default)]
    pub file_urls: Vec<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub points: f64,
}

impl ChatLogEntry {
    /// Entry written before generation starts; `response` stays empty until the answer lands.
    pub fn pending(
        prompt: impl Into<String>,
        chat_type: ChatType,
        model: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            response: None,
            timestamp,
            chat_type,
            input_token: 0,
            output_token: 0,
            output_time: 0,
            file_urls: Vec::new(),
            model: model.into(),
            points: 0.0,
        }
    }

    pub fn resolved(&self, response: impl Into<String>, usage: Option<UsageReport>) -> Self {
        let usage = usage.unwrap_or_default();
        Self {
            response: Some(response.into()),
            input_token: usage.input_token,
            output_token: usage.output_token,
            output_time: usage.output_time,
            points: usage.points,
            ..self.clone()
        }
    }

    /// Two entries describe the same user turn when prompt and timestamp match.
    pub fn same_turn(&self, other: &ChatLogEntry) -> bool {
        self.timestamp == other.timestamp && self.prompt == other.prompt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub chats: Vec<ChatLogEntry>,
}

/// Prompt/response pair forwarded to the model as conversation context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchStepsRequest {
    pub prompt: String,
    #[serde(default)]
    pub chat_log: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResearchStepsResponse {
    /// JSON document `{"topics": [...]}` encoded as a string.
    pub topics: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    pub title: String,
    #[serde(default)]
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub learning_datas: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchRequest {
    pub prompt: String,
    /// A new session is started when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub chat_log: Vec<ChatTurn>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FastAnswerResponse {
    pub content: String,
    pub success: bool,
    pub input_token: u64,
    pub output_token: u64,
    pub points: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendHistoryRequest {
    pub session_id: String,
    pub entry: ChatLogEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameSessionRequest {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteSessionRequest {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogQuery {
    pub session_id: String,
}
