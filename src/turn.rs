//! conversation turns and the outgoing wire format.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// content sent for an image-only user turn.
pub const IMAGE_ONLY_PROMPT: &str = "Please analyze this image";
/// content of the assistant turn that carries a generated image.
pub const GENERATED_IMAGE_CAPTION: &str = "Here's your generated image:";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// backend mode tag. `Image` skips streaming entirely.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Chat,
    Code,
    Image,
    Video,
}

impl ChatMode {
    pub const ALL: [ChatMode; 4] = [ChatMode::Chat, ChatMode::Code, ChatMode::Image, ChatMode::Video];

    pub fn label(self) -> &'static str {
        match self {
            ChatMode::Chat => "chat",
            ChatMode::Code => "code",
            ChatMode::Image => "image",
            ChatMode::Video => "video",
        }
    }

    /// prompt hint shown while the input is empty.
    pub fn placeholder(self) -> &'static str {
        match self {
            ChatMode::Chat => "ask me to chat with you...",
            ChatMode::Code => "ask me to generate code...",
            ChatMode::Image => "ask me to create an image...",
            ChatMode::Video => "ask me to describe a video concept...",
        }
    }

    pub fn is_streaming(self) -> bool {
        !matches!(self, ChatMode::Image)
    }
}

/// one message of the conversation.
///
/// content only grows while `streaming` is set; [`ConversationTurn::freeze`]
/// closes the turn for good.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConversationTurn {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// milliseconds since the unix epoch.
    pub created_at: u64,
    /// image supplied by the user with this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_image: Option<String>,
    /// image produced by the image endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_image: Option<String>,
    #[serde(default)]
    pub streaming: bool,
}

impl ConversationTurn {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: next_turn_id(),
            role,
            content,
            created_at: now_millis(),
            attached_image: None,
            generated_image: None,
            streaming: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// user turn with an attached image. empty text falls back to
    /// [`IMAGE_ONLY_PROMPT`].
    pub fn user_with_image(content: impl Into<String>, image: impl Into<String>) -> Self {
        let content = content.into();
        let content = if content.trim().is_empty() {
            IMAGE_ONLY_PROMPT.to_string()
        } else {
            content
        };
        Self {
            attached_image: Some(image.into()),
            ..Self::new(Role::User, content)
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// empty, open assistant turn ("assistant is typing").
    pub fn placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::new(Role::Assistant, String::new())
        }
    }

    /// complete assistant turn for an image generation result.
    pub fn generated_image(image: impl Into<String>) -> Self {
        Self {
            generated_image: Some(image.into()),
            ..Self::new(Role::Assistant, GENERATED_IMAGE_CAPTION.to_string())
        }
    }

    /// append a fragment to an open turn. returns `false` (and leaves the
    /// content untouched) once the turn is frozen.
    pub fn append(&mut self, fragment: &str) -> bool {
        if !self.streaming {
            return false;
        }
        self.content.push_str(fragment);
        true
    }

    pub fn freeze(&mut self) {
        self.streaming = false;
    }

    pub fn to_outgoing(&self) -> OutgoingMessage {
        let content = match &self.attached_image {
            Some(url) => OutgoingContent::Parts(vec![
                ContentPart::Text { text: self.content.clone() },
                ContentPart::ImageUrl { image_url: ImageUrl { url: url.clone() } },
            ]),
            None => OutgoingContent::Text(self.content.clone()),
        };
        OutgoingMessage { role: self.role, content }
    }
}

// ---------------------- wire types ----------------------

/// body of the text endpoint.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub messages: Vec<OutgoingMessage>,
    pub mode: ChatMode,
}

impl TextRequest {
    pub fn from_history(history: &[ConversationTurn], mode: ChatMode) -> Self {
        Self {
            messages: history.iter().map(ConversationTurn::to_outgoing).collect(),
            mode,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub role: Role,
    pub content: OutgoingContent,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OutgoingContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

/// body of the image endpoint.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageResponse {
    #[serde(default)]
    pub image_url: Option<String>,
}

// ---------------------- ids & clocks ----------------------

static NEXT_TURN: AtomicU64 = AtomicU64::new(1);

fn next_turn_id() -> String {
    let seq = NEXT_TURN.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", now_millis(), seq)
}

#[cfg(not(target_arch = "wasm32"))]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(target_arch = "wasm32")]
pub fn now_millis() -> u64 {
    js_sys::Date::now() as u64
}
