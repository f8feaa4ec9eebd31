use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound chat message as handed over by the hosting platform adapter.
///
/// The adapter resolves everything platform-specific before this point:
/// mention parsing, attachment URLs, the reply target, and whether the
/// sender is the designated operator identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub author_id: String,
    pub author_name: Option<String>,
    pub guild_id: String,
    pub channel_id: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub mentioned_users: Vec<MentionedUser>,
    pub is_privileged_sender: bool,
    /// Content of the bot message this one replies to, if any.
    pub replied_to_bot_text: Option<String>,
}

impl InboundMessage {
    pub fn text(
        author_id: impl Into<String>,
        guild_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            author_id: author_id.into(),
            author_name: None,
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            text: text.into(),
            attachments: Vec::new(),
            mentioned_users: Vec::new(),
            is_privileged_sender: false,
            replied_to_bot_text: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
}

impl Attachment {
    /// Whether the attachment looks like an image the vision model can read.
    pub fn is_image(&self) -> bool {
        let name = self.filename.to_lowercase();
        [".png", ".jpg", ".jpeg", ".gif", ".webp"]
            .iter()
            .any(|ext| name.ends_with(ext))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionedUser {
    pub id: String,
    pub name: String,
}

/// One turn in a stored conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: EntryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub author_name: Option<String>,
}

impl ConversationEntry {
    pub fn new(role: EntryRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            author_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    System,
    User,
    Assistant,
}

impl EntryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryRole::System => "system",
            EntryRole::User => "user",
            EntryRole::Assistant => "assistant",
        }
    }

    /// Parse a stored role string; unknown values degrade to `User` so a
    /// corrupted row never aborts a history load.
    pub fn parse(value: &str) -> Self {
        match value {
            "system" => EntryRole::System,
            "assistant" => EntryRole::Assistant,
            _ => EntryRole::User,
        }
    }
}
