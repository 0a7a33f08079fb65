use std::io::Cursor;

use dasher_contracts::analysis::{decode_analysis_response, AnalysisResult, HeuristicParser};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{AnalysisEndpoint, GenerationConfig, ImageAnalyzer, ImageBytes, ImageGenerator};
use crate::cancel::CancelToken;
use crate::error::{AnalysisError, GenerationError};

const DRYRUN_PLAN: &[(&str, &[&str])] = &[
    ("lighting", &["golden hour", "studio softbox", "neon"]),
    ("color palette", &["warm", "cool"]),
    ("style", &["photorealistic", "watercolor"]),
];

/// Offline generator: a solid-color PNG whose color is hashed from the prompt.
#[derive(Debug, Clone)]
pub struct DryrunGenerator {
    width: u32,
    height: u32,
}

impl DryrunGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl Default for DryrunGenerator {
    fn default() -> Self {
        Self::new(256, 256)
    }
}

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        cancel: &CancelToken,
    ) -> Result<ImageBytes, GenerationError> {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let (r, g, b) = color_from_prompt(prompt, config.steps);
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([r, g, b]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|err| GenerationError::Transport(format!("dryrun encode failed: {err}")))?;
        Ok(ImageBytes::png(buffer.into_inner()))
    }
}

/// Offline analyzer: answers in the response shape of the configured
/// endpoint and decodes it exactly like the HTTP adapter does.
#[derive(Debug, Clone)]
pub struct DryrunAnalyzer {
    endpoint: AnalysisEndpoint,
}

impl DryrunAnalyzer {
    pub fn new(endpoint: AnalysisEndpoint) -> Self {
        Self { endpoint }
    }

    fn response_for(&self, original_prompt: Option<&str>) -> Value {
        let prompt = original_prompt.unwrap_or_default().to_ascii_lowercase();
        let steps = DRYRUN_PLAN
            .iter()
            .filter(|(detail, _)| !prompt.contains(&format!("with {detail}:")))
            .collect::<Vec<_>>();

        match self.endpoint {
            AnalysisEndpoint::RefinementPlan => json!({
                "status": "success",
                "refinementPlan": steps
                    .iter()
                    .map(|(detail, options)| json!({"detail": detail, "options": options}))
                    .collect::<Vec<Value>>(),
            }),
            AnalysisEndpoint::AnalyzeForDetail => match steps.first() {
                Some((detail, options)) => json!({
                    "status": "success",
                    "suggestedDetail": detail,
                    "detailOptions": options,
                }),
                None => json!({"status": "no_suggestion"}),
            },
            AnalysisEndpoint::Analyze => {
                let sections = steps
                    .iter()
                    .map(|(detail, options)| format!("**{detail}: {}**", options.join(" + ")))
                    .collect::<String>();
                json!({
                    "description": format!("user\nDescribe this image.\nassistant\n{sections}"),
                })
            }
        }
    }
}

impl ImageAnalyzer for DryrunAnalyzer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(
        &self,
        image: &ImageBytes,
        original_prompt: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        if image.bytes.is_empty() {
            return Err(AnalysisError::InvalidResponse(
                "dryrun analyzer received an empty image".to_string(),
            ));
        }
        Ok(decode_analysis_response(
            &self.response_for(original_prompt),
            &HeuristicParser,
        ))
    }
}

fn color_from_prompt(prompt: &str, seed: u32) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
