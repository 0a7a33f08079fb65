mod parser;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use parser::{
    extract_refined_prompt, extract_sections, AnalysisParser, HeuristicParser, ParseError,
    ASSISTANT_MARKER,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSection {
    pub parameter: String,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementStep {
    pub detail: String,
    pub options: Vec<String>,
}

/// Ordered refinement roadmap for one base image. Immutable once received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefinementPlan {
    steps: Vec<RefinementStep>,
}

impl RefinementPlan {
    pub fn new(steps: Vec<RefinementStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&RefinementStep> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[RefinementStep] {
        &self.steps
    }
}

/// What the controller gets back from one analysis call, whatever endpoint
/// variant produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisResult {
    /// Free-form description the parser could not structure.
    Text(String),
    RefinedPrompt(String),
    Sections(Vec<DetailSection>),
    Plan(RefinementPlan),
    None,
}

impl AnalysisResult {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::RefinedPrompt(_) => "refined_prompt",
            Self::Sections(_) => "sections",
            Self::Plan(_) => "plan",
            Self::None => "none",
        }
    }
}

/// Maps any analysis response body onto [`AnalysisResult`].
///
/// Shapes, checked in order:
/// - `{status, refinementPlan: [{detail, options[]}]}`
/// - `{status, suggestedDetail, detailOptions[]}` (a one-step plan)
/// - `{status, refined_prompt}`
/// - `{description}` (free text, handed to `parser`)
///
/// A `status` other than `"success"` means the service had nothing to offer.
/// Malformed entries degrade to `None` instead of failing the round.
pub fn decode_analysis_response(payload: &Value, parser: &dyn AnalysisParser) -> AnalysisResult {
    let Some(obj) = payload.as_object() else {
        return AnalysisResult::None;
    };
    if let Some(status) = obj.get("status").and_then(Value::as_str) {
        if !status.eq_ignore_ascii_case("success") {
            return AnalysisResult::None;
        }
    }

    if let Some(rows) = obj.get("refinementPlan").and_then(Value::as_array) {
        let steps = rows.iter().filter_map(step_from_value).collect::<Vec<_>>();
        return AnalysisResult::Plan(RefinementPlan::new(steps));
    }

    if let Some(detail) = non_empty_str(obj.get("suggestedDetail")) {
        let options = string_list(obj.get("detailOptions"));
        if options.is_empty() {
            return AnalysisResult::None;
        }
        return AnalysisResult::Plan(RefinementPlan::new(vec![RefinementStep {
            detail,
            options,
        }]));
    }

    if let Some(prompt) = non_empty_str(obj.get("refined_prompt")) {
        return AnalysisResult::RefinedPrompt(prompt);
    }

    match obj.get("description").and_then(Value::as_str) {
        Some(text) => parser.parse(text),
        None => AnalysisResult::None,
    }
}

fn step_from_value(value: &Value) -> Option<RefinementStep> {
    let obj = value.as_object()?;
    let detail = non_empty_str(obj.get("detail"))?;
    let options = string_list(obj.get("options"));
    if options.is_empty() {
        return None;
    }
    Some(RefinementStep { detail, options })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| non_empty_str(Some(row)))
                .collect()
        })
        .unwrap_or_default()
}
