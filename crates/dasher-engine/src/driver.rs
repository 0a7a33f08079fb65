use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::adapters::{ImageAnalyzer, ImageGenerator};
use crate::controller::{
    Completion, OptionChoice, OptionImage, RefinementController, Request, RequestKind, State,
};
use crate::error::{AnalysisError, GenerationError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How unattended runs answer an option offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickStrategy {
    First,
    Last,
    /// Stop at the first offer and leave it for the caller.
    None,
}

impl PickStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            "none" | "manual" => Some(Self::None),
            _ => None,
        }
    }

    pub fn pick(self, options: &[OptionImage]) -> Option<usize> {
        if options.is_empty() {
            return None;
        }
        match self {
            Self::First => Some(0),
            Self::Last => Some(options.len() - 1),
            Self::None => None,
        }
    }
}

/// Where a session came to rest after waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Idle,
    AwaitingSelection,
    Interrupted,
}

/// Runs a [`RefinementController`] against real adapters.
///
/// Each request runs on its own worker thread; results come back over a
/// channel and are applied one at a time on the caller's thread, so the
/// controller is never touched concurrently.
pub struct Session {
    controller: RefinementController,
    generator: Arc<dyn ImageGenerator>,
    analyzer: Arc<dyn ImageAnalyzer>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    poll_interval: Duration,
}

impl Session {
    pub fn new(
        controller: RefinementController,
        generator: Arc<dyn ImageGenerator>,
        analyzer: Arc<dyn ImageAnalyzer>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            controller,
            generator,
            analyzer,
            sender,
            receiver,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn controller(&self) -> &RefinementController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut RefinementController {
        &mut self.controller
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub fn analyzer_name(&self) -> &str {
        self.analyzer.name()
    }

    pub fn set_analyzer(&mut self, analyzer: Arc<dyn ImageAnalyzer>) {
        self.analyzer = analyzer;
    }

    pub fn submit(&mut self, prompt: &str) -> Result<()> {
        let requests = self.controller.submit(prompt)?;
        self.dispatch(requests)
    }

    pub fn select(&mut self, choice: OptionChoice) -> Result<()> {
        let requests = self.controller.select(choice)?;
        self.dispatch(requests)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.controller.reset()
    }

    /// Applies at most one completion. Returns whether one arrived in time.
    pub fn pump(&mut self, timeout: Duration) -> Result<bool> {
        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => {
                let follow_up = self.controller.apply(completion)?;
                self.dispatch(follow_up)?;
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(false),
        }
    }

    /// Pumps until the controller stops being busy. `interrupted` is polled
    /// between completions; when it reports true the round is reset.
    pub fn wait_settled(&mut self, interrupted: &dyn Fn() -> bool) -> Result<Settled> {
        while self.controller.is_busy() {
            if interrupted() {
                self.controller.reset()?;
                return Ok(Settled::Interrupted);
            }
            self.pump(self.poll_interval)?;
        }
        Ok(match self.controller.state() {
            State::AwaitingSelection { .. } => Settled::AwaitingSelection,
            _ => Settled::Idle,
        })
    }

    /// Submits `prompt` and walks the whole plan, picking options with
    /// `strategy`.
    pub fn run_auto(
        &mut self,
        prompt: &str,
        strategy: PickStrategy,
        interrupted: &dyn Fn() -> bool,
    ) -> Result<Settled> {
        self.submit(prompt)?;
        loop {
            let settled = self.wait_settled(interrupted)?;
            if settled != Settled::AwaitingSelection {
                return Ok(settled);
            }
            let Some(index) = strategy.pick(self.controller.options()) else {
                return Ok(settled);
            };
            self.select(OptionChoice::Index(index))?;
        }
    }

    fn dispatch(&self, requests: Vec<Request>) -> Result<()> {
        for request in requests {
            let generator = Arc::clone(&self.generator);
            let analyzer = Arc::clone(&self.analyzer);
            let sender = self.sender.clone();
            let name = format!(
                "dasher-r{}-{:?}-{}",
                request.ticket.round, request.ticket.stage, request.ticket.slot
            );
            thread::Builder::new()
                .name(name)
                .spawn(move || execute(request, generator.as_ref(), analyzer.as_ref(), &sender))
                .context("failed to spawn request worker")?;
        }
        Ok(())
    }
}

fn execute(
    request: Request,
    generator: &dyn ImageGenerator,
    analyzer: &dyn ImageAnalyzer,
    sender: &Sender<Completion>,
) {
    let Request {
        ticket,
        kind,
        cancel,
    } = request;
    if cancel.is_cancelled() {
        return;
    }
    // A panicking adapter still has to answer its ticket, or the session
    // would wait on it forever.
    let completion = match kind {
        RequestKind::Generate { prompt, config } => {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                generator.generate(&prompt, &config, &cancel)
            }))
            .unwrap_or_else(|payload| {
                Err(GenerationError::Transport(panic_message(payload.as_ref())))
            });
            Completion::generated(ticket, result)
        }
        RequestKind::Analyze {
            image,
            original_prompt,
        } => {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                analyzer.analyze(&image, Some(&original_prompt), &cancel)
            }))
            .unwrap_or_else(|payload| {
                Err(AnalysisError::Transport(panic_message(payload.as_ref())))
            });
            Completion::analyzed(ticket, result)
        }
    };
    if cancel.is_cancelled() {
        return;
    }
    let _ = sender.send(completion);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("adapter panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    use dasher_contracts::analysis::{AnalysisResult, RefinementPlan, RefinementStep};
    use dasher_contracts::events::EventWriter;

    use super::*;
    use crate::adapters::{
        AnalysisEndpoint, DryrunAnalyzer, DryrunGenerator, GenerationConfig, ImageBytes,
    };
    use crate::cancel::CancelToken;
    use crate::images::ImageStore;

    struct ScriptedGenerator {
        fail_when: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(fail_when: Option<&str>) -> Self {
            Self {
                fail_when: fail_when.map(str::to_string),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl ImageGenerator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(
            &self,
            prompt: &str,
            _config: &GenerationConfig,
            _cancel: &CancelToken,
        ) -> Result<ImageBytes, GenerationError> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            match self.fail_when.as_deref() {
                Some(needle) if prompt.contains(needle) => Err(GenerationError::Status {
                    status: 500,
                    body: format!("cannot render {needle}"),
                }),
                _ => Ok(ImageBytes::png(prompt.as_bytes().to_vec())),
            }
        }
    }

    /// Blocks its first call until released, then reports whether the call
    /// had been cancelled in the meantime.
    struct GatedAnalyzer {
        gate: Mutex<Receiver<()>>,
        first: AtomicBool,
        saw_cancel: AtomicBool,
        plan: RefinementPlan,
    }

    impl ImageAnalyzer for GatedAnalyzer {
        fn name(&self) -> &str {
            "gated"
        }

        fn analyze(
            &self,
            _image: &ImageBytes,
            _original_prompt: Option<&str>,
            cancel: &CancelToken,
        ) -> Result<AnalysisResult, AnalysisError> {
            if self.first.swap(false, Ordering::SeqCst) {
                if let Ok(gate) = self.gate.lock() {
                    let _ = gate.recv_timeout(Duration::from_secs(5));
                }
                self.saw_cancel.store(cancel.is_cancelled(), Ordering::SeqCst);
            }
            Ok(AnalysisResult::Plan(self.plan.clone()))
        }
    }

    fn session(generator: Arc<dyn ImageGenerator>, analyzer: Arc<dyn ImageAnalyzer>) -> Session {
        let controller =
            RefinementController::new(ImageStore::in_memory(), EventWriter::disabled("test"));
        Session::new(controller, generator, analyzer).with_poll_interval(Duration::from_millis(20))
    }

    fn never() -> bool {
        false
    }

    fn color_plan() -> RefinementPlan {
        RefinementPlan::new(vec![RefinementStep {
            detail: "color".to_string(),
            options: vec!["red".to_string(), "blue".to_string(), "green".to_string()],
        }])
    }

    #[test]
    fn pick_strategy_parses_and_picks() {
        assert_eq!(PickStrategy::parse(" Last "), Some(PickStrategy::Last));
        assert_eq!(PickStrategy::parse("manual"), Some(PickStrategy::None));
        assert_eq!(PickStrategy::parse("random"), None);
        assert_eq!(PickStrategy::First.pick(&[]), None);
    }

    #[test]
    fn run_auto_walks_the_dryrun_plan() -> anyhow::Result<()> {
        let mut session = session(
            Arc::new(DryrunGenerator::new(4, 4)),
            Arc::new(DryrunAnalyzer::new(AnalysisEndpoint::RefinementPlan)),
        );
        let settled = session.run_auto("a red car", PickStrategy::First, &never)?;
        assert_eq!(settled, Settled::Idle);

        let controller = session.controller();
        assert!(controller.plan_complete());
        assert_eq!(controller.history().len(), 4);
        assert_eq!(
            controller.prompt(),
            "a red car with lighting: golden hour with color palette: warm with style: photorealistic"
        );
        assert_eq!(controller.images().len(), 4);
        Ok(())
    }

    #[test]
    fn run_auto_with_manual_pick_stops_at_the_offer() -> anyhow::Result<()> {
        let generator = Arc::new(ScriptedGenerator::new(None));
        let mut session = session(
            generator.clone(),
            Arc::new(DryrunAnalyzer::new(AnalysisEndpoint::AnalyzeForDetail)),
        );
        let settled = session.run_auto("a boat", PickStrategy::None, &never)?;
        assert_eq!(settled, Settled::AwaitingSelection);
        assert_eq!(session.controller().options().len(), 3);

        session.select(OptionChoice::Named("neon".to_string()))?;
        assert_eq!(session.wait_settled(&never)?, Settled::Idle);
        assert_eq!(session.controller().prompt(), "a boat with lighting: neon");
        assert_eq!(generator.prompts.lock().map(|p| p.len()).unwrap_or(0), 4);
        Ok(())
    }

    #[test]
    fn failed_option_surfaces_as_round_error() -> anyhow::Result<()> {
        let analyzer = GatedAnalyzer {
            gate: Mutex::new(mpsc::channel().1),
            first: AtomicBool::new(false),
            saw_cancel: AtomicBool::new(false),
            plan: color_plan(),
        };
        let mut session = session(
            Arc::new(ScriptedGenerator::new(Some("green"))),
            Arc::new(analyzer),
        );
        let settled = session.run_auto("a kite", PickStrategy::First, &never)?;
        assert_eq!(settled, Settled::Idle);
        let controller = session.controller();
        assert_eq!(
            controller.last_error(),
            Some("image generation failed (500): cannot render green")
        );
        assert!(controller.options().is_empty());
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.images().len(), 1);
        Ok(())
    }

    #[test]
    fn resubmitting_cancels_the_previous_round() -> anyhow::Result<()> {
        let (release, gate) = mpsc::channel();
        let analyzer = Arc::new(GatedAnalyzer {
            gate: Mutex::new(gate),
            first: AtomicBool::new(true),
            saw_cancel: AtomicBool::new(false),
            plan: color_plan(),
        });
        let mut session = session(Arc::new(ScriptedGenerator::new(None)), analyzer.clone());

        session.submit("first")?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.controller().state() != &State::AwaitingAnalysis && Instant::now() < deadline
        {
            session.pump(Duration::from_millis(20))?;
        }
        assert_eq!(session.controller().state(), &State::AwaitingAnalysis);

        session.submit("second")?;
        assert_eq!(session.wait_settled(&never)?, Settled::AwaitingSelection);
        let _ = release.send(());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !analyzer.saw_cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
            session.pump(Duration::from_millis(20))?;
        }

        assert!(analyzer.saw_cancel.load(Ordering::SeqCst));
        let controller = session.controller();
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.history()[0].prompt, "second");
        assert_eq!(controller.options()[0].prompt, "second with color: red");
        Ok(())
    }

    #[test]
    fn interrupt_resets_the_round() -> anyhow::Result<()> {
        let mut session = session(
            Arc::new(DryrunGenerator::default()),
            Arc::new(DryrunAnalyzer::new(AnalysisEndpoint::RefinementPlan)),
        );
        let settled = session.run_auto("a fox", PickStrategy::First, &|| true)?;
        assert_eq!(settled, Settled::Interrupted);
        assert_eq!(session.controller().state(), &State::Idle);
        assert!(session.controller().history().is_empty());
        assert!(session.controller().images().is_empty());
        Ok(())
    }

    struct PanickingAnalyzer;

    impl ImageAnalyzer for PanickingAnalyzer {
        fn name(&self) -> &str {
            "panicking"
        }

        fn analyze(
            &self,
            _image: &ImageBytes,
            _original_prompt: Option<&str>,
            _cancel: &CancelToken,
        ) -> Result<AnalysisResult, AnalysisError> {
            panic!("decoder blew up");
        }
    }

    #[test]
    fn panicking_adapter_fails_the_round_instead_of_hanging() -> anyhow::Result<()> {
        let mut session = session(
            Arc::new(DryrunGenerator::default()),
            Arc::new(PanickingAnalyzer),
        );
        let started = Instant::now();
        let settled = session.run_auto("a fox", PickStrategy::First, &never)?;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(settled, Settled::Idle);
        assert_eq!(
            session.controller().last_error(),
            Some("image analysis transport error: adapter panicked: decoder blew up")
        );
        assert_eq!(session.controller().history().len(), 1);
        Ok(())
    }
}
