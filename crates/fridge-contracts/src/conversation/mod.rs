use std::fmt;

use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageError};
use serde::{Deserialize, Serialize};

/// Text stored on the user turn that carries the camera frame.
pub const IMAGE_TURN_TEXT: &str = "(Image attached)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded camera frame together with the bytes it was decoded from.
///
/// The raw bytes are kept so the frame can be forwarded to the model
/// without re-encoding.
#[derive(Clone)]
pub struct CameraImage {
    bytes: Vec<u8>,
    mime_type: String,
    decoded: DynamicImage,
    source_url: String,
    fetched_at: DateTime<Utc>,
}

impl CameraImage {
    /// Sniffs the format from the bytes and decodes them.
    pub fn from_bytes(bytes: Vec<u8>, source_url: impl Into<String>) -> Result<Self, ImageError> {
        let format = image::guess_format(&bytes)?;
        let decoded = image::load_from_memory_with_format(&bytes, format)?;
        Ok(Self {
            mime_type: format.to_mime_type().to_string(),
            bytes,
            decoded,
            source_url: source_url.into(),
            fetched_at: Utc::now(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn decoded(&self) -> &DynamicImage {
        &self.decoded
    }

    pub fn width(&self) -> u32 {
        self.decoded.width()
    }

    pub fn height(&self) -> u32 {
        self.decoded.height()
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

impl fmt::Debug for CameraImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraImage")
            .field("mime_type", &self.mime_type)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bytes", &self.bytes.len())
            .field("source_url", &self.source_url)
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Turn {
    role: Role,
    text: String,
    image: Option<CameraImage>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            image: None,
        }
    }

    pub fn user_image(image: CameraImage) -> Self {
        Self {
            role: Role::User,
            text: IMAGE_TURN_TEXT.to_string(),
            image: Some(image),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            image: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn image(&self) -> Option<&CameraImage> {
        self.image.as_ref()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// Append-only transcript for one chat session.
///
/// Turns are handed out by shared reference only; once pushed they are
/// never edited, reordered or removed.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a turn and returns its index.
    pub fn push(&mut self, turn: Turn) -> usize {
        self.turns.push(turn);
        self.turns.len() - 1
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, index: usize) -> Option<&Turn> {
        self.turns.get(index)
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }
}
