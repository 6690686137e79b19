//! Streamed turn output units and user message construction
//!
//! A turn's output reaches the caller as a sequence of [`StreamChunk`]s,
//! terminated by exactly one `done` or `error` chunk. Outgoing user turns
//! are structured [`UserMessage`]s in which attachments are ordered before
//! text, matching the backend's documented content preference.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// One unit of streamed turn output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamChunk {
    /// Assistant text delta
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// Extended thinking delta
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { text: String },

    /// Tool invocation started
    #[serde(rename = "tool_start")]
    ToolStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool invocation finished
    #[serde(rename = "tool_end")]
    ToolEnd {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    /// Token usage report. `session_id` is filled in at forwarding time
    /// with whatever session is current at that moment.
    #[serde(rename = "usage")]
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        session_id: Option<String>,
    },

    /// Terminal failure chunk
    #[serde(rename = "error")]
    Error { message: String },

    /// Terminal completion chunk
    #[serde(rename = "done")]
    Done { stop_reason: Option<String> },
}

impl StreamChunk {
    /// Whether this chunk terminates the turn stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Done { .. } | StreamChunk::Error { .. })
    }

    /// Whether this chunk carries streamed assistant text.
    pub fn is_stream_text(&self) -> bool {
        matches!(self, StreamChunk::TextDelta { .. })
    }
}

/// An attachment supplied alongside a prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    /// Inline image, base64 payload
    Image { media_type: String, data: String },
    /// Workspace file reference, resolved by the backend
    File { path: String },
}

impl Attachment {
    /// Build an image attachment from raw bytes.
    pub fn image_from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Attachment::Image {
            media_type: media_type.into(),
            data: BASE64.encode(bytes),
        }
    }
}

/// One block of an outgoing user message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { media_type: String, data: String },
    FileRef { path: String },
}

/// A structured user turn sent to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub blocks: Vec<ContentBlock>,
}

impl UserMessage {
    /// Compose a user message from prompt text, attachments, and an
    /// optional conversation recap.
    ///
    /// Attachments come first, then the recap, then the prompt text. The
    /// backend prefers images ahead of the text that references them.
    pub fn compose(prompt: &str, attachments: &[Attachment], recap: Option<&str>) -> Self {
        let mut blocks = Vec::with_capacity(attachments.len() + 2);

        for attachment in attachments {
            blocks.push(match attachment {
                Attachment::Image { media_type, data } => ContentBlock::Image {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                Attachment::File { path } => ContentBlock::FileRef { path: path.clone() },
            });
        }

        if let Some(recap) = recap {
            blocks.push(ContentBlock::Text {
                text: recap.to_string(),
            });
        }

        blocks.push(ContentBlock::Text {
            text: prompt.to_string(),
        });

        Self { blocks }
    }

    /// Concatenated text content (recap plus prompt), for logging.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// Role of a prior conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One prior message, supplied by the host when conversational context
/// must be rebuilt (fresh session after an interruption).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub text: String,
}

impl HistoryMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Fold prior messages into a recap block for a fresh backend session.
pub fn history_recap(history: &[HistoryMessage]) -> Option<String> {
    if history.is_empty() {
        return None;
    }

    let mut recap = String::from(
        "Context from the conversation so far (the session was restarted):\n",
    );
    for message in history {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        recap.push_str(&format!("[{}] {}\n", role, message.text));
    }
    Some(recap)
}
