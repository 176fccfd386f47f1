use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

// -- Upstream chat-completion SSE types ---------------------------------------

#[derive(Debug, Serialize)]
pub struct UpstreamChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamChoice {
    pub delta: UpstreamDelta,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamChunk {
    #[serde(default)]
    pub choices: Vec<UpstreamChoice>,
}

impl UpstreamChunk {
    /// Text fragment carried by the first choice, if any and non-empty.
    pub fn fragment(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Error envelope shared by the chat and image endpoints.
///
/// Inference providers disagree on the shape: some send
/// `{"error": {"message": "..."}}`, others `{"error": "..."}`.
#[derive(Debug, Deserialize)]
pub struct UpstreamErrorBody {
    pub error: UpstreamErrorField,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UpstreamErrorField {
    Detailed { message: String },
    Text(String),
}

impl UpstreamErrorBody {
    pub fn message(&self) -> &str {
        match &self.error {
            UpstreamErrorField::Detailed { message } => message,
            UpstreamErrorField::Text(text) => text,
        }
    }

    /// Best-effort extraction from a raw response body.
    pub fn parse_message(body: &[u8]) -> Option<String> {
        serde_json::from_slice::<UpstreamErrorBody>(body)
            .ok()
            .map(|b| b.message().to_string())
            .filter(|m| !m.is_empty())
    }
}

// -- Image endpoint ------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ImageRequest<'a> {
    pub inputs: &'a str,
}
