use std::time::Duration;

use anyhow::{Context, Result};
use dasher_contracts::analysis::{
    decode_analysis_response, AnalysisParser, AnalysisResult, HeuristicParser,
};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use super::{AnalysisEndpoint, GenerationConfig, ImageAnalyzer, ImageBytes, ImageGenerator};
use crate::cancel::CancelToken;
use crate::error::{error_chain_text, truncate_text, AnalysisError, GenerationError};

const ERROR_BODY_MAX_CHARS: usize = 512;

fn build_client(timeout: Duration) -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

fn normalize_base(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Reads a failed response into `(status, truncated body)`.
fn failure_parts(response: HttpResponse) -> (u16, String) {
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    (status, truncate_text(body.trim(), ERROR_BODY_MAX_CHARS))
}

/// Client for `POST {base}/generate`.
///
/// The blocking transport cannot be interrupted mid-request; the token is
/// checked before sending and again before the body is read, so a cancelled
/// call never reports a result.
pub struct HttpGenerator {
    base_url: String,
    http: HttpClient,
}

impl HttpGenerator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base(base_url),
            http: build_client(timeout)?,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/generate", self.base_url)
    }
}

impl ImageGenerator for HttpGenerator {
    fn name(&self) -> &str {
        "http"
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
        let response = self
            .http
            .post(self.endpoint())
            .json(&json!({
                "prompt": prompt,
                "num_inference_steps": config.steps,
                "guidance_scale": config.guidance,
            }))
            .send()
            .map_err(|err| {
                GenerationError::Transport(error_chain_text(&err, ERROR_BODY_MAX_CHARS))
            })?;
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        if !response.status().is_success() {
            let (status, body) = failure_parts(response);
            return Err(GenerationError::Status { status, body });
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| {
                GenerationError::Transport(error_chain_text(&err, ERROR_BODY_MAX_CHARS))
            })?
            .to_vec();
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        if bytes.is_empty() {
            return Err(GenerationError::EmptyImage);
        }
        Ok(ImageBytes { bytes, mime_type })
    }
}

/// Client for the analysis service; uploads the image as multipart `file`
/// plus an optional `original_prompt` field.
pub struct HttpAnalyzer {
    base_url: String,
    endpoint: AnalysisEndpoint,
    http: HttpClient,
    parser: Box<dyn AnalysisParser>,
}

impl HttpAnalyzer {
    pub fn new(base_url: &str, endpoint: AnalysisEndpoint, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base(base_url),
            endpoint,
            http: build_client(timeout)?,
            parser: Box::new(HeuristicParser),
        })
    }

    pub fn with_parser(mut self, parser: Box<dyn AnalysisParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url, self.endpoint.path())
    }

    fn build_form(
        image: &ImageBytes,
        original_prompt: Option<&str>,
    ) -> Result<MultipartForm, AnalysisError> {
        let mime = image
            .mime_type
            .clone()
            .unwrap_or_else(|| "image/png".to_string());
        let part = MultipartPart::bytes(image.bytes.clone())
            .file_name(format!("image.{}", image.extension()))
            .mime_str(&mime)
            .map_err(|err| AnalysisError::Transport(format!("invalid image mime {mime}: {err}")))?;
        let mut form = MultipartForm::new().part("file", part);
        if let Some(prompt) = original_prompt
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            form = form.text("original_prompt", prompt.to_string());
        }
        Ok(form)
    }
}

impl ImageAnalyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        "http"
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
        let form = Self::build_form(image, original_prompt)?;
        let response = self
            .http
            .post(self.url())
            .multipart(form)
            .send()
            .map_err(|err| AnalysisError::Transport(error_chain_text(&err, ERROR_BODY_MAX_CHARS)))?;
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        if !response.status().is_success() {
            let (status, body) = failure_parts(response);
            return Err(AnalysisError::Status { status, body });
        }

        let body = response
            .text()
            .map_err(|err| AnalysisError::Transport(error_chain_text(&err, ERROR_BODY_MAX_CHARS)))?;
        let payload: Value = serde_json::from_str(&body).map_err(|err| {
            AnalysisError::InvalidResponse(format!(
                "{err}: {}",
                truncate_text(&body, ERROR_BODY_MAX_CHARS)
            ))
        })?;
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(decode_analysis_response(&payload, self.parser.as_ref()))
    }
}
