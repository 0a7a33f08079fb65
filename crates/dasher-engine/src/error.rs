use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("image generation failed ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("image generation transport error: {0}")]
    Transport(String),
    #[error("image generation returned an empty body")]
    EmptyImage,
    #[error("image generation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("image analysis failed ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("image analysis transport error: {0}")]
    Transport(String),
    #[error("image analysis returned an invalid payload: {0}")]
    InvalidResponse(String),
    #[error("image analysis cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl AnalysisError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Flattens a transport error and its causes into one line.
pub(crate) fn error_chain_text(
    err: &(dyn std::error::Error + 'static),
    max_chars: usize,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
