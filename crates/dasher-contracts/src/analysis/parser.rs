use once_cell::sync::Lazy;
use regex::Regex;

use super::{AnalysisResult, DetailSection};

/// Marker the analysis model uses to frame its own reply.
pub const ASSISTANT_MARKER: &str = "assistant";

const SECTION_DELIMITER: &str = "**";

static REFINED_PROMPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)prompt that would be used to generate this image[:\s]+([^.]*)")
        .expect("refined prompt pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("analysis text has no 'assistant' marker")]
    MissingMarker,
    #[error("analysis payload after the marker is empty")]
    EmptyPayload,
    #[error("analysis text does not mention a generation prompt")]
    NoMatch,
}

/// Extracts structure from free-form analysis text.
///
/// Every heuristic about the upstream model's phrasing lives behind this
/// trait; callers only ever see an `Option` or an [`AnalysisResult`].
pub trait AnalysisParser: Send + Sync {
    fn refined_prompt(&self, text: &str) -> Option<String>;
    fn sections(&self, text: &str) -> Option<Vec<DetailSection>>;

    /// Refined prompt wins over sections; unstructured text is passed through
    /// and blank text is `None`.
    fn parse(&self, text: &str) -> AnalysisResult {
        if let Some(prompt) = self.refined_prompt(text) {
            return AnalysisResult::RefinedPrompt(prompt);
        }
        match self.sections(text) {
            Some(sections) if !sections.is_empty() => AnalysisResult::Sections(sections),
            _ if text.trim().is_empty() => AnalysisResult::None,
            _ => AnalysisResult::Text(text.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicParser;

impl AnalysisParser for HeuristicParser {
    fn refined_prompt(&self, text: &str) -> Option<String> {
        extract_refined_prompt(text).ok()
    }

    fn sections(&self, text: &str) -> Option<Vec<DetailSection>> {
        extract_sections(text).ok()
    }
}

pub fn extract_refined_prompt(text: &str) -> Result<String, ParseError> {
    let capture = REFINED_PROMPT_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .ok_or(ParseError::NoMatch)?;
    if capture.is_empty() {
        return Err(ParseError::NoMatch);
    }
    Ok(capture.to_string())
}

pub fn extract_sections(text: &str) -> Result<Vec<DetailSection>, ParseError> {
    let (_, payload) = text
        .split_once(ASSISTANT_MARKER)
        .ok_or(ParseError::MissingMarker)?;
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(ParseError::EmptyPayload);
    }

    Ok(payload
        .split(SECTION_DELIMITER)
        .filter(|segment| !segment.is_empty())
        .map(parse_section)
        .collect())
}

fn parse_section(segment: &str) -> DetailSection {
    let (parameter, description) = segment.split_once(':').unwrap_or((segment, ""));
    let description = description.trim();
    let bullets = description
        .split('+')
        .map(str::trim)
        .filter(|point| !point.is_empty())
        .map(str::to_string)
        .collect::<Vec<String>>();
    DetailSection {
        parameter: parameter.trim().to_string(),
        details: if bullets.is_empty() {
            vec![description.to_string()]
        } else {
            bullets
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(parameter: &str, details: &[&str]) -> DetailSection {
        DetailSection {
            parameter: parameter.to_string(),
            details: details.iter().map(|value| value.to_string()).collect(),
        }
    }

    #[test]
    fn sections_split_parameters_and_bullets() -> anyhow::Result<()> {
        let text = "user\ndescribe the image\nassistant\n**Lighting: soft + warm tones**\n**Style: watercolor**";
        let sections = extract_sections(text)?;
        assert_eq!(
            sections,
            vec![
                section("Lighting", &["soft", "warm tones"]),
                section("", &[""]),
                section("Style", &["watercolor"]),
            ]
        );
        Ok(())
    }

    #[test]
    fn sections_require_assistant_marker() {
        assert_eq!(
            extract_sections("**Lighting: soft + warm**"),
            Err(ParseError::MissingMarker)
        );
        assert_eq!(HeuristicParser.sections("no framing here"), None);
    }

    #[test]
    fn sections_reject_empty_payload() {
        assert_eq!(
            extract_sections("system prompt assistant   \n"),
            Err(ParseError::EmptyPayload)
        );
    }

    #[test]
    fn description_colons_after_the_first_are_kept() -> anyhow::Result<()> {
        let sections = extract_sections("assistant **Ratio: 16:9 + 4:3**")?;
        assert_eq!(sections, vec![section("Ratio", &["16:9", "4:3"])]);
        Ok(())
    }

    #[test]
    fn description_without_bullets_falls_back_to_whole_text() -> anyhow::Result<()> {
        let sections = extract_sections("assistant **Mood: +** **Palette**")?;
        assert_eq!(
            sections,
            vec![
                section("Mood", &["+"]),
                section("", &[""]),
                section("Palette", &[""]),
            ]
        );
        Ok(())
    }

    #[test]
    fn only_truly_empty_segments_are_dropped() -> anyhow::Result<()> {
        let spaced = extract_sections("assistant **A: x** **B: y**")?;
        assert_eq!(
            spaced,
            vec![section("A", &["x"]), section("", &[""]), section("B", &["y"])]
        );

        let adjacent = extract_sections("assistant **A: x****B: y**")?;
        assert_eq!(adjacent, vec![section("A", &["x"]), section("B", &["y"])]);
        Ok(())
    }

    #[test]
    fn refined_prompt_captures_up_to_period() {
        let text = "The PROMPT that would be used to generate this image:  a red car at dusk. Extra notes.";
        assert_eq!(
            HeuristicParser.refined_prompt(text).as_deref(),
            Some("a red car at dusk")
        );
    }

    #[test]
    fn refined_prompt_absent_or_empty_is_none() {
        assert_eq!(
            extract_refined_prompt("nothing useful here"),
            Err(ParseError::NoMatch)
        );
        assert_eq!(
            HeuristicParser.refined_prompt("prompt that would be used to generate this image: ."),
            None
        );
    }

    #[test]
    fn parse_prefers_refined_prompt_then_sections() {
        let both = "assistant **Light: dim** prompt that would be used to generate this image: a lamp.";
        assert_eq!(
            HeuristicParser.parse(both),
            AnalysisResult::RefinedPrompt("a lamp".to_string())
        );
        assert_eq!(
            HeuristicParser.parse("assistant **Light: dim**"),
            AnalysisResult::Sections(vec![section("Light", &["dim"])])
        );
        assert_eq!(
            HeuristicParser.parse("plain text"),
            AnalysisResult::Text("plain text".to_string())
        );
        assert_eq!(HeuristicParser.parse(" \n "), AnalysisResult::None);
    }
}
