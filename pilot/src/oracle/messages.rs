//! Chat message building blocks sent to the model.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::executor::Screen;
use crate::states::{State, StateCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: ImageDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>, detail: ImageDetail) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The observed screen, with OCR text when present.
pub fn screen_message(screen: &Screen, detail: ImageDetail) -> ChatMessage {
    let mut content = vec![
        ContentPart::text("Here is the observed screen:"),
        ContentPart::image(
            format!("data:image/png;base64,{}", screen.image_b64),
            detail,
        ),
    ];
    if let Some(ocr) = &screen.ocr_text {
        content.push(ContentPart::text(format!("OCR of the screen: {ocr}")));
    }
    ChatMessage::new(Role::User, content)
}

/// Candidate states as a JSON list, for text-only classification.
pub fn state_list_message(candidates: &[StateCandidate]) -> ChatMessage {
    let listed = serde_json::to_string(candidates).unwrap_or_default();
    ChatMessage::user(format!("Possible states: {listed}"))
}

/// One candidate state with its reference screenshots.
pub async fn state_example_message(state: &State, detail: ImageDetail) -> std::io::Result<ChatMessage> {
    let mut content = vec![ContentPart::text(format!(
        "Possible state: '{}', description: {}",
        state.id, state.description
    ))];
    for reference in &state.example_screenshots {
        content.push(ContentPart::text("Example:"));
        content.push(ContentPart::image(reference_image_url(reference).await?, detail));
    }
    Ok(ChatMessage::new(Role::User, content))
}

/// URLs pass through; local paths are inlined as base64 data URLs.
pub async fn reference_image_url(reference: &str) -> std::io::Result<String> {
    if reference.starts_with("http://")
        || reference.starts_with("https://")
        || reference.starts_with("data:")
    {
        return Ok(reference.to_string());
    }
    let bytes = tokio::fs::read(Path::new(reference)).await?;
    Ok(format!("data:{};base64,{}", mime_for(reference), STANDARD.encode(bytes)))
}

fn mime_for(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}
