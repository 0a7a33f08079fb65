mod dryrun;
mod http;

use dasher_contracts::analysis::AnalysisResult;

use crate::cancel::CancelToken;
use crate::error::{AnalysisError, GenerationError};

pub use dryrun::{DryrunAnalyzer, DryrunGenerator};
pub use http::{HttpAnalyzer, HttpGenerator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl ImageBytes {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: Some("image/png".to_string()),
        }
    }

    pub fn extension(&self) -> &'static str {
        let lowered = self
            .mime_type
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        "png"
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    pub steps: u32,
    pub guidance: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            steps: 4,
            guidance: 0.0,
        }
    }
}

/// Analysis service routes. They differ only in which response shape the
/// service sends back; decoding handles every shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisEndpoint {
    Analyze,
    AnalyzeForDetail,
    RefinementPlan,
}

impl AnalysisEndpoint {
    pub const ALL: [AnalysisEndpoint; 3] = [
        AnalysisEndpoint::Analyze,
        AnalysisEndpoint::AnalyzeForDetail,
        AnalysisEndpoint::RefinementPlan,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::AnalyzeForDetail => "analyze-for-detail",
            Self::RefinementPlan => "get-refinement-plan",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().trim_start_matches('/').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|endpoint| endpoint.path() == normalized)
    }
}

impl std::fmt::Display for AnalysisEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        cancel: &CancelToken,
    ) -> Result<ImageBytes, GenerationError>;
}

pub trait ImageAnalyzer: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(
        &self,
        image: &ImageBytes,
        original_prompt: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_accepts_paths_with_slash() {
        assert_eq!(
            AnalysisEndpoint::parse("/get-refinement-plan"),
            Some(AnalysisEndpoint::RefinementPlan)
        );
        assert_eq!(
            AnalysisEndpoint::parse(" Analyze-For-Detail "),
            Some(AnalysisEndpoint::AnalyzeForDetail)
        );
        assert_eq!(AnalysisEndpoint::parse("describe"), None);
    }

    #[test]
    fn extension_follows_mime_type() {
        assert_eq!(ImageBytes::png(Vec::new()).extension(), "png");
        let jpeg = ImageBytes {
            bytes: Vec::new(),
            mime_type: Some("image/JPEG".to_string()),
        };
        assert_eq!(jpeg.extension(), "jpg");
        let unknown = ImageBytes {
            bytes: Vec::new(),
            mime_type: None,
        };
        assert_eq!(unknown.extension(), "png");
    }
}
