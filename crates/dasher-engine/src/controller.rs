use std::mem;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dasher_contracts::analysis::{AnalysisResult, DetailSection, RefinementPlan, RefinementStep};
use dasher_contracts::events::EventWriter;
use dasher_contracts::session::{refine_prompt, HistoryEntry};
use serde_json::json;

use crate::adapters::{GenerationConfig, ImageBytes};
use crate::cancel::CancelToken;
use crate::error::{AnalysisError, GenerationError};
use crate::images::{ImageHandle, ImageStore};

/// Which part of a round a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Base,
    Analysis,
    Options { step: usize },
}

/// Identifies a request so its completion can be matched against the live
/// round. `slot` is the option index during fan-out and 0 otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub round: u64,
    pub stage: Stage,
    pub slot: usize,
}

#[derive(Debug, Clone)]
pub enum RequestKind {
    Generate {
        prompt: String,
        config: GenerationConfig,
    },
    Analyze {
        image: Arc<ImageBytes>,
        original_prompt: String,
    },
}

/// Work the controller wants performed. The controller never performs IO
/// itself; a driver executes requests and feeds back [`Completion`]s.
#[derive(Debug, Clone)]
pub struct Request {
    pub ticket: Ticket,
    pub kind: RequestKind,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub enum Outcome {
    Generated(Result<ImageBytes, GenerationError>),
    Analyzed(Result<AnalysisResult, AnalysisError>),
}

#[derive(Debug)]
pub struct Completion {
    pub ticket: Ticket,
    pub outcome: Outcome,
}

impl Completion {
    pub fn generated(ticket: Ticket, result: Result<ImageBytes, GenerationError>) -> Self {
        Self {
            ticket,
            outcome: Outcome::Generated(result),
        }
    }

    pub fn analyzed(ticket: Ticket, result: Result<AnalysisResult, AnalysisError>) -> Self {
        Self {
            ticket,
            outcome: Outcome::Analyzed(result),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionImage {
    pub option: String,
    pub image: ImageHandle,
    pub prompt: String,
}

/// One fan-out request slot; `image` fills in when its generation lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSlot {
    pub option: String,
    pub prompt: String,
    pub image: Option<ImageHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Generating,
    AwaitingAnalysis,
    GeneratingOptions { step: usize, slots: Vec<OptionSlot> },
    AwaitingSelection { step: usize, options: Vec<OptionImage> },
}

impl State {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::AwaitingAnalysis => "awaiting_analysis",
            Self::GeneratingOptions { .. } => "generating_options",
            Self::AwaitingSelection { .. } => "awaiting_selection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionChoice {
    Index(usize),
    Named(String),
}

/// The refinement loop: generate, analyze, fan out one image per option,
/// wait for a pick, append to history, move to the next planned detail.
///
/// Every request carries the round's [`CancelToken`]; submitting, resetting,
/// failing or dropping the controller fires it. Completions are accepted only
/// while their ticket matches the live round and the current state still
/// expects them.
pub struct RefinementController {
    state: State,
    prompt: String,
    current_image: Option<ImageHandle>,
    plan: Option<RefinementPlan>,
    step_index: usize,
    sections: Vec<DetailSection>,
    description: Option<String>,
    history: Vec<HistoryEntry>,
    last_error: Option<String>,
    notice: Option<String>,
    config: GenerationConfig,
    round: u64,
    cancel: CancelToken,
    images: ImageStore,
    events: EventWriter,
}

impl RefinementController {
    pub fn new(images: ImageStore, events: EventWriter) -> Self {
        Self {
            state: State::Idle,
            prompt: String::new(),
            current_image: None,
            plan: None,
            step_index: 0,
            sections: Vec::new(),
            description: None,
            history: Vec::new(),
            last_error: None,
            notice: None,
            config: GenerationConfig::default(),
            round: 0,
            cancel: CancelToken::new(),
            images,
            events,
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_config(&mut self, config: GenerationConfig) {
        self.config = config;
    }

    pub fn config(&self) -> GenerationConfig {
        self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            State::Generating | State::AwaitingAnalysis | State::GeneratingOptions { .. }
        )
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn current_image(&self) -> Option<&ImageHandle> {
        self.current_image.as_ref()
    }

    pub fn plan(&self) -> Option<&RefinementPlan> {
        self.plan.as_ref()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// The detail being refined, while options are generating or on offer.
    pub fn current_step(&self) -> Option<&RefinementStep> {
        let step = match &self.state {
            State::GeneratingOptions { step, .. } | State::AwaitingSelection { step, .. } => *step,
            _ => return None,
        };
        self.plan.as_ref().and_then(|plan| plan.step(step))
    }

    pub fn options(&self) -> &[OptionImage] {
        match &self.state {
            State::AwaitingSelection { options, .. } => options,
            _ => &[],
        }
    }

    pub fn plan_complete(&self) -> bool {
        self.state == State::Idle
            && self
                .plan
                .as_ref()
                .map(|plan| self.step_index >= plan.len())
                .unwrap_or(false)
    }

    pub fn sections(&self) -> &[DetailSection] {
        &self.sections
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn dismiss_error(&mut self) {
        self.last_error = None;
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Starts a new round. Whatever the previous round had in flight is
    /// cancelled and all of its state, history included, is released.
    pub fn submit(&mut self, prompt: &str) -> Result<Vec<Request>> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("prompt is empty");
        }
        self.events.emit_value(
            "round_submitted",
            json!({
                "round": self.round + 1,
                "prompt": prompt,
                "steps": self.config.steps,
                "guidance": self.config.guidance,
            }),
        )?;
        self.clear_round();
        self.prompt = prompt.to_string();
        self.state = State::Generating;
        Ok(vec![self.request(
            Stage::Base,
            0,
            RequestKind::Generate {
                prompt: self.prompt.clone(),
                config: self.config,
            },
        )])
    }

    /// Back to `Idle` with no plan, options, history or in-flight requests.
    /// The prompt text is kept. Calling it twice is harmless.
    pub fn reset(&mut self) -> Result<()> {
        let cancelled_in_flight = self.is_busy();
        self.clear_round();
        self.events.emit_value(
            "session_reset",
            json!({
                "round": self.round,
                "cancelled_in_flight": cancelled_in_flight,
            }),
        )?;
        Ok(())
    }

    pub fn apply(&mut self, completion: Completion) -> Result<Vec<Request>> {
        let Completion { ticket, outcome } = completion;
        if !self.is_live(&ticket) {
            self.discard(&ticket, "superseded")?;
            return Ok(Vec::new());
        }
        match (ticket.stage, outcome) {
            (Stage::Base, Outcome::Generated(result)) => self.on_base_generated(result),
            (Stage::Analysis, Outcome::Analyzed(result)) => self.on_analyzed(result),
            (Stage::Options { step }, Outcome::Generated(result)) => {
                self.on_option_generated(step, ticket.slot, result)
            }
            _ => {
                self.discard(&ticket, "outcome does not match stage")?;
                Ok(Vec::new())
            }
        }
    }

    pub fn select(&mut self, choice: OptionChoice) -> Result<Vec<Request>> {
        let (step, index) = match &self.state {
            State::AwaitingSelection { step, options } => {
                (*step, resolve_choice(options, &choice)?)
            }
            _ => bail!("no options are awaiting selection"),
        };
        let detail = self
            .plan
            .as_ref()
            .and_then(|plan| plan.step(step))
            .map(|row| row.detail.clone())
            .unwrap_or_default();
        if let Some(chosen) = self.options().get(index) {
            self.events.emit_value(
                "option_selected",
                json!({
                    "round": self.round,
                    "step": step,
                    "detail": detail,
                    "option": chosen.option,
                    "prompt": chosen.prompt,
                    "image": chosen.image.as_str(),
                }),
            )?;
        }

        let options = match mem::replace(&mut self.state, State::Idle) {
            State::AwaitingSelection { options, .. } => options,
            _ => Vec::new(),
        };
        let mut chosen = None;
        for (idx, option) in options.into_iter().enumerate() {
            if idx == index {
                chosen = Some(option);
            } else {
                self.images.revoke(&option.image);
            }
        }
        let chosen = chosen.context("selected option disappeared")?;
        self.current_image = Some(chosen.image.clone());
        self.prompt = chosen.prompt.clone();
        self.history.push(HistoryEntry::refined(
            chosen.prompt,
            chosen.image.as_str(),
            detail,
            chosen.option,
        ));

        let next = step + 1;
        let plan_len = self.plan.as_ref().map(RefinementPlan::len).unwrap_or(0);
        if next < plan_len {
            self.present_step(next)
        } else {
            self.finish_plan()
        }
    }

    fn request(&self, stage: Stage, slot: usize, kind: RequestKind) -> Request {
        Request {
            ticket: Ticket {
                round: self.round,
                stage,
                slot,
            },
            kind,
            cancel: self.cancel.clone(),
        }
    }

    fn is_live(&self, ticket: &Ticket) -> bool {
        if ticket.round != self.round {
            return false;
        }
        match (&self.state, ticket.stage) {
            (State::Generating, Stage::Base) | (State::AwaitingAnalysis, Stage::Analysis) => {
                ticket.slot == 0
            }
            (State::GeneratingOptions { step, slots }, Stage::Options { step: ticket_step }) => {
                *step == ticket_step
                    && slots
                        .get(ticket.slot)
                        .map(|slot| slot.image.is_none())
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Fires the current token and moves to a fresh round id so nothing
    /// issued so far can land.
    fn retire_requests(&mut self) {
        self.cancel.cancel();
        self.cancel = CancelToken::new();
        self.round += 1;
    }

    fn clear_round(&mut self) {
        self.retire_requests();
        self.images.revoke_all();
        self.state = State::Idle;
        self.current_image = None;
        self.plan = None;
        self.step_index = 0;
        self.sections.clear();
        self.description = None;
        self.history.clear();
        self.last_error = None;
        self.notice = None;
    }

    fn discard(&self, ticket: &Ticket, reason: &str) -> Result<()> {
        self.events.emit_value(
            "stale_completion_discarded",
            json!({
                "round": ticket.round,
                "live_round": self.round,
                "stage": format!("{:?}", ticket.stage),
                "slot": ticket.slot,
                "reason": reason,
            }),
        )?;
        Ok(())
    }

    /// Ends the live round without emitting anything: partial option images
    /// are released, outstanding requests retired and the state left `Idle`.
    /// Returns the id of the round that was ended.
    fn abort_round(&mut self, message: String) -> u64 {
        if let State::GeneratingOptions { slots, .. } = mem::replace(&mut self.state, State::Idle) {
            for handle in slots.into_iter().filter_map(|slot| slot.image) {
                self.images.revoke(&handle);
            }
        }
        let round = self.round;
        self.retire_requests();
        self.last_error = Some(message);
        round
    }

    /// A failed event write must not strand the machine in a busy state with
    /// nothing in flight.
    fn abandon(&mut self, err: anyhow::Error) -> Result<Vec<Request>> {
        self.abort_round(format!("{err:#}"));
        Err(err)
    }

    fn fail(&mut self, stage: &str, message: String) -> Result<Vec<Request>> {
        let round = self.abort_round(message.clone());
        self.events.emit_value(
            "round_failed",
            json!({
                "round": round,
                "stage": stage,
                "error": message,
                "history_len": self.history.len(),
            }),
        )?;
        Ok(Vec::new())
    }

    fn on_base_generated(
        &mut self,
        result: Result<ImageBytes, GenerationError>,
    ) -> Result<Vec<Request>> {
        let image = match result {
            Ok(image) => image,
            Err(err) => return self.fail("generate", err.to_string()),
        };
        let handle = match self.images.insert(image) {
            Ok(handle) => handle,
            Err(err) => return self.fail("generate", format!("failed to keep image: {err:#}")),
        };
        let Some(bytes) = self.images.get(&handle) else {
            return self.fail("generate", format!("image {handle} vanished"));
        };

        if let Err(err) = self.events.emit_value(
            "image_generated",
            json!({
                "round": self.round,
                "image": handle.as_str(),
                "path": self.images.path(&handle).map(|path| path.display().to_string()),
                "bytes": bytes.bytes.len(),
            }),
        ) {
            self.images.revoke(&handle);
            return self.abandon(err);
        }
        self.current_image = Some(handle.clone());
        self.history
            .push(HistoryEntry::initial(self.prompt.clone(), handle.as_str()));
        self.state = State::AwaitingAnalysis;
        Ok(vec![self.request(
            Stage::Analysis,
            0,
            RequestKind::Analyze {
                image: bytes,
                original_prompt: self.prompt.clone(),
            },
        )])
    }

    fn on_analyzed(
        &mut self,
        result: Result<AnalysisResult, AnalysisError>,
    ) -> Result<Vec<Request>> {
        let result = match result {
            Ok(result) => result,
            Err(err) => return self.fail("analyze", err.to_string()),
        };
        if let Err(err) = self.events.emit_value(
            "analysis_received",
            json!({"round": self.round, "kind": result.kind()}),
        ) {
            return self.abandon(err);
        }

        self.state = State::Idle;
        match result {
            AnalysisResult::Plan(plan) => {
                let empty = plan.is_empty();
                self.plan = Some(plan);
                self.step_index = 0;
                if empty {
                    self.notice = Some("analysis proposed no refinements".to_string());
                    return self.finish_plan();
                }
                self.present_step(0)
            }
            AnalysisResult::RefinedPrompt(prompt) => {
                self.prompt = prompt;
                self.notice = Some("refined prompt ready; submit it to iterate".to_string());
                Ok(Vec::new())
            }
            AnalysisResult::Sections(sections) => {
                self.sections = sections;
                Ok(Vec::new())
            }
            AnalysisResult::Text(text) => {
                self.description = Some(text);
                Ok(Vec::new())
            }
            AnalysisResult::None => {
                self.notice = Some("no suggestion available".to_string());
                Ok(Vec::new())
            }
        }
    }

    fn present_step(&mut self, index: usize) -> Result<Vec<Request>> {
        let Some(step) = self
            .plan
            .as_ref()
            .and_then(|plan| plan.step(index))
            .cloned()
        else {
            return self.finish_plan();
        };
        self.step_index = index;
        if step.options.is_empty() {
            return self.present_step(index + 1);
        }

        let base = self
            .history
            .last()
            .map(|entry| entry.prompt.clone())
            .unwrap_or_else(|| self.prompt.clone());
        let slots = step
            .options
            .iter()
            .map(|option| OptionSlot {
                option: option.clone(),
                prompt: refine_prompt(&base, &step.detail, option),
                image: None,
            })
            .collect::<Vec<_>>();
        let requests = slots
            .iter()
            .enumerate()
            .map(|(slot, row)| {
                self.request(
                    Stage::Options { step: index },
                    slot,
                    RequestKind::Generate {
                        prompt: row.prompt.clone(),
                        config: self.config,
                    },
                )
            })
            .collect::<Vec<_>>();

        self.events.emit_value(
            "plan_step_presented",
            json!({
                "round": self.round,
                "step": index,
                "plan_len": self.plan.as_ref().map(RefinementPlan::len).unwrap_or(0),
                "detail": step.detail,
                "options": step.options,
            }),
        )?;
        self.state = State::GeneratingOptions { step: index, slots };
        Ok(requests)
    }

    fn on_option_generated(
        &mut self,
        step: usize,
        slot: usize,
        result: Result<ImageBytes, GenerationError>,
    ) -> Result<Vec<Request>> {
        let image = match result {
            Ok(image) => image,
            Err(err) => return self.fail("options", err.to_string()),
        };
        let handle = match self.images.insert(image) {
            Ok(handle) => handle,
            Err(err) => return self.fail("options", format!("failed to keep image: {err:#}")),
        };

        let options = match &mut self.state {
            State::GeneratingOptions { slots, .. } => {
                if let Some(row) = slots.get_mut(slot) {
                    row.image = Some(handle);
                }
                if slots.iter().any(|row| row.image.is_none()) {
                    return Ok(Vec::new());
                }
                mem::take(slots)
                    .into_iter()
                    .filter_map(|row| {
                        Some(OptionImage {
                            image: row.image?,
                            option: row.option,
                            prompt: row.prompt,
                        })
                    })
                    .collect::<Vec<_>>()
            }
            _ => {
                self.images.revoke(&handle);
                return Ok(Vec::new());
            }
        };

        let names = options
            .iter()
            .map(|row| row.option.clone())
            .collect::<Vec<_>>();
        self.state = State::AwaitingSelection { step, options };
        self.events.emit_value(
            "options_generated",
            json!({"round": self.round, "step": step, "options": names}),
        )?;
        Ok(Vec::new())
    }

    fn finish_plan(&mut self) -> Result<Vec<Request>> {
        self.state = State::Idle;
        let plan_len = self.plan.as_ref().map(RefinementPlan::len).unwrap_or(0);
        self.step_index = plan_len;
        self.events.emit_value(
            "plan_completed",
            json!({
                "round": self.round,
                "steps": plan_len,
                "history_len": self.history.len(),
                "prompt": self.prompt,
            }),
        )?;
        Ok(Vec::new())
    }
}

impl Drop for RefinementController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn resolve_choice(options: &[OptionImage], choice: &OptionChoice) -> Result<usize> {
    match choice {
        OptionChoice::Index(index) if *index < options.len() => Ok(*index),
        OptionChoice::Index(index) => bail!(
            "option {} is out of range (1-{})",
            index + 1,
            options.len()
        ),
        OptionChoice::Named(name) => {
            let wanted = name.trim();
            options
                .iter()
                .position(|row| row.option.eq_ignore_ascii_case(wanted))
                .with_context(|| format!("no option named '{wanted}'"))
        }
    }
}
