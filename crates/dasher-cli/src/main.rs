use std::collections::HashSet;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use dasher_contracts::analysis::AnalysisResult;
use dasher_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use dasher_contracts::events::EventWriter;
use dasher_contracts::session::{write_summary, SessionRecord, SessionSummary};
use dasher_engine::{
    AnalysisEndpoint, CancelToken, EngineConfig, ImageBytes, ImageStore, OptionChoice,
    PickStrategy, RefinementController, Session, Settled, State,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "dasher", version, about = "Iterative image refinement in the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
    Analyze(AnalyzeArgs),
    Export(ExportArgs),
}

/// Overrides for the `DASHER_*` environment settings.
#[derive(Debug, Clone, Default, Args)]
struct ServiceArgs {
    #[arg(long)]
    generate_url: Option<String>,
    #[arg(long)]
    analyze_url: Option<String>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    guidance: Option<f64>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    service: ServiceArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "first")]
    pick: String,
    #[arg(long, default_value_t = 1)]
    rounds: u32,
    #[command(flatten)]
    service: ServiceArgs,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: Option<String>,
    #[command(flatten)]
    service: ServiceArgs,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    run: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const EXIT_FAILED: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("dasher error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_oneshot(args),
        Command::Analyze(args) => run_analyze(args),
        Command::Export(args) => run_export(args),
    }
}

fn resolve_config(service: &ServiceArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env();
    apply_service_args(&mut config, service)?;
    for warning in &config.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(config)
}

fn apply_service_args(config: &mut EngineConfig, service: &ServiceArgs) -> Result<()> {
    if let Some(url) = non_empty(service.generate_url.as_deref()) {
        config.generate_url = url.trim_end_matches('/').to_string();
    }
    if let Some(url) = non_empty(service.analyze_url.as_deref()) {
        config.analyze_url = url.trim_end_matches('/').to_string();
    }
    if let Some(raw) = non_empty(service.endpoint.as_deref()) {
        config.endpoint = parse_endpoint(&raw)?;
    }
    if let Some(steps) = service.steps {
        if steps == 0 {
            bail!("--steps must be positive");
        }
        config.generation.steps = steps;
    }
    if let Some(guidance) = service.guidance {
        if !guidance.is_finite() || guidance < 0.0 {
            bail!("--guidance must be a non-negative number");
        }
        config.generation.guidance = guidance;
    }
    if service.dryrun {
        config.dryrun = true;
    }
    Ok(())
}

fn parse_endpoint(raw: &str) -> Result<AnalysisEndpoint> {
    AnalysisEndpoint::parse(raw).with_context(|| {
        let known = AnalysisEndpoint::ALL
            .iter()
            .map(|endpoint| endpoint.path())
            .collect::<Vec<_>>()
            .join(", ");
        format!("unknown analysis endpoint '{}' (expected one of: {known})", raw.trim())
    })
}

fn install_interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    if let Err(err) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        eprintln!("warning: Ctrl+C will not cancel rounds ({err})");
    }
    flag
}

fn open_session(
    config: &EngineConfig,
    out_dir: &Path,
    events_path: &Path,
    session_id: &str,
) -> Result<Session> {
    let images = ImageStore::with_spill_dir(out_dir.join("live"))?;
    let events = EventWriter::new(events_path, session_id);
    let controller = RefinementController::new(images, events).with_config(config.generation);
    Ok(
        Session::new(controller, config.generator()?, config.analyzer()?)
            .with_poll_interval(POLL_INTERVAL),
    )
}

/// Mirrors every committed history entry into `history.json`, copying its
/// image out of the transient store before the next round releases it.
struct SessionRecorder {
    out_dir: PathBuf,
    record: SessionRecord,
    recorded: HashSet<String>,
    started_at: String,
    rounds_submitted: u64,
    selections: Vec<Map<String, Value>>,
}

impl SessionRecorder {
    fn open(out_dir: &Path) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let record = SessionRecord::load(out_dir.join("history.json"));
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            record,
            recorded: HashSet::new(),
            started_at: now_utc_iso(),
            rounds_submitted: 0,
            selections: Vec::new(),
        })
    }

    fn session_id(&self) -> &str {
        &self.record.session_id
    }

    fn note_submit(&mut self) {
        self.rounds_submitted += 1;
    }

    fn sync(&mut self, controller: &RefinementController) -> Result<usize> {
        let images_dir = self.out_dir.join("images");
        let mut added = 0;
        for entry in controller.history() {
            if !self.recorded.insert(entry.image.clone()) {
                continue;
            }
            let stem = format!("{:03}", self.record.entries.len());
            let image_path = match controller.images().resolve(&entry.image) {
                Some(handle) => Some(
                    controller
                        .images()
                        .persist(&handle, &images_dir, &stem)?
                        .to_string_lossy()
                        .to_string(),
                ),
                None => None,
            };
            if let (Some(detail), Some(option)) = (&entry.detail, &entry.detail_value) {
                let mut selection = Map::new();
                selection.insert("detail".to_string(), json!(detail));
                selection.insert("option".to_string(), json!(option));
                selection.insert("prompt".to_string(), json!(entry.prompt));
                self.selections.push(selection);
            }
            self.record.push(entry.clone(), image_path);
            added += 1;
        }
        if added > 0 {
            self.record.save()?;
        }
        Ok(added)
    }

    fn finish(&mut self, controller: &RefinementController, config: &EngineConfig) -> Result<()> {
        self.sync(controller)?;
        self.record.save()?;
        let summary = SessionSummary {
            session_id: self.record.session_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            rounds_submitted: self.rounds_submitted,
            total_images: self.record.entries.len() as u64,
            final_prompt: self.record.final_prompt().map(str::to_string),
            selections: self.selections.clone(),
        };
        let mut extra = Map::new();
        extra.insert("dryrun".to_string(), Value::Bool(config.dryrun));
        extra.insert("endpoint".to_string(), json!(config.endpoint.path()));
        extra.insert("steps".to_string(), json!(config.generation.steps));
        extra.insert("guidance".to_string(), json!(config.generation.guidance));
        write_summary(&self.out_dir.join("summary.json"), &summary, Some(&extra))
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let mut config = resolve_config(&args.service)?;
    let mut recorder = SessionRecorder::open(&args.out)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut session = open_session(&config, &args.out, &events_path, recorder.session_id())?;
    let interrupt = install_interrupt_flag();

    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "Dasher chat started ({} generator, {} analyzer, endpoint {}). Type /help for commands.",
        session.generator_name(),
        session.analyzer_name(),
        config.endpoint
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }
        interrupt.store(false, Ordering::SeqCst);

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Anything else is submitted as a prompt.");
            }
            "submit" => {
                let Some(prompt) = intent.prompt.as_deref() else {
                    continue;
                };
                if session.controller().is_busy() {
                    println!("Busy; wait for the current round or /reset.");
                    continue;
                }
                recorder.sync(session.controller())?;
                if let Err(err) = session.submit(prompt) {
                    println!("Submit failed: {err:#}");
                    continue;
                }
                recorder.note_submit();
                let settled = wait_with_progress(&mut session, &interrupt)?;
                recorder.sync(session.controller())?;
                report_settled(&mut session, settled);
            }
            "select_option" => {
                let index = intent.command_args.get("index").and_then(Value::as_u64);
                let option = value_as_non_empty_string(intent.command_args.get("option"));
                let choice = if let Some(index) = index {
                    OptionChoice::Index(index as usize)
                } else if let Some(option) = option {
                    OptionChoice::Named(option)
                } else {
                    println!("/pick requires an option number or name");
                    continue;
                };
                if let Err(err) = session.select(choice) {
                    println!("Pick failed: {err}");
                    continue;
                }
                let settled = wait_with_progress(&mut session, &interrupt)?;
                recorder.sync(session.controller())?;
                report_settled(&mut session, settled);
            }
            "reset" => {
                recorder.sync(session.controller())?;
                session.reset()?;
                println!("Session reset.");
            }
            "show_plan" => print_plan(session.controller()),
            "show_history" => print_history(session.controller()),
            "show_status" => print_status(&session, &config),
            "set_steps" => {
                if let Some(steps) = intent
                    .settings_update
                    .get("steps")
                    .and_then(Value::as_u64)
                    .and_then(|value| u32::try_from(value).ok())
                {
                    config.generation.steps = steps;
                    session.controller_mut().set_config(config.generation);
                    println!("Inference steps set to {steps}");
                }
            }
            "set_guidance" => {
                if let Some(guidance) = intent
                    .settings_update
                    .get("guidance")
                    .and_then(Value::as_f64)
                {
                    config.generation.guidance = guidance;
                    session.controller_mut().set_config(config.generation);
                    println!("Guidance scale set to {guidance}");
                }
            }
            "set_endpoint" => {
                let Some(raw) = value_as_non_empty_string(intent.command_args.get("endpoint"))
                else {
                    println!("Analysis endpoint: {}", config.endpoint);
                    continue;
                };
                match parse_endpoint(&raw) {
                    Ok(endpoint) => {
                        config.endpoint = endpoint;
                        session.set_analyzer(config.analyzer_for(endpoint)?);
                        println!("Analysis endpoint set to {endpoint}");
                    }
                    Err(err) => println!("{err}"),
                }
            }
            "analyze_image" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/analyze requires a path");
                    continue;
                };
                let prompt = session.controller().prompt().to_string();
                let prompt = non_empty(Some(prompt.as_str()));
                match analyze_file(&config, Path::new(&path), prompt.as_deref()) {
                    Ok(result) => print_analysis(&result),
                    Err(err) => println!("Analyze failed: {err:#}"),
                }
            }
            "export" => {
                recorder.sync(session.controller())?;
                recorder.record.save()?;
                let out_path = value_as_non_empty_string(intent.command_args.get("path"))
                    .map(PathBuf::from)
                    .unwrap_or_else(|| args.out.join("export.html"));
                export_html(&args.out, &out_path)?;
                println!("Exported to {}", out_path.display());
            }
            "quit" => break,
            "invalid" => {
                println!(
                    "/{}: {}",
                    value_as_non_empty_string(intent.command_args.get("command"))
                        .unwrap_or_default(),
                    value_as_non_empty_string(intent.command_args.get("reason"))
                        .unwrap_or_default()
                );
            }
            _ => {
                println!(
                    "Unknown command: /{}",
                    value_as_non_empty_string(intent.command_args.get("command"))
                        .unwrap_or_else(|| intent.action.clone())
                );
            }
        }
    }

    recorder.finish(session.controller(), &config)?;
    println!("Session saved to {}", args.out.display());
    Ok(())
}

fn run_oneshot(args: RunArgs) -> Result<i32> {
    let config = resolve_config(&args.service)?;
    let strategy = PickStrategy::parse(&args.pick)
        .with_context(|| format!("unknown pick strategy '{}' (first, last, none)", args.pick))?;
    let mut recorder = SessionRecorder::open(&args.out)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut session = open_session(&config, &args.out, &events_path, recorder.session_id())?;
    let interrupt = install_interrupt_flag();
    let interrupted = || interrupt.load(Ordering::SeqCst);

    let mut prompt = args.prompt.clone();
    let mut settled = Settled::Idle;
    for round in 0..args.rounds.max(1) {
        if round > 0 {
            recorder.sync(session.controller())?;
            println!("Resubmitting refined prompt: {prompt}");
        }
        recorder.note_submit();
        settled = match session.run_auto(&prompt, strategy, &interrupted) {
            Ok(settled) => settled,
            Err(err) => {
                recorder.finish(session.controller(), &config)?;
                return Err(err);
            }
        };
        recorder.sync(session.controller())?;
        if settled != Settled::Idle || session.controller().last_error().is_some() {
            break;
        }
        match refined_prompt_pending(session.controller()) {
            Some(refined) => prompt = refined,
            None => break,
        }
    }

    let controller = session.controller();
    let code = match settled {
        Settled::Interrupted => {
            println!("Cancelled.");
            EXIT_INTERRUPTED
        }
        Settled::AwaitingSelection => {
            print_options(controller);
            0
        }
        Settled::Idle => match controller.last_error() {
            Some(err) => {
                eprintln!("!! {err}");
                EXIT_FAILED
            }
            None => {
                if let Some(notice) = controller.notice() {
                    println!("{notice}");
                }
                println!("Final prompt: {}", controller.prompt());
                0
            }
        },
    };
    recorder.finish(controller, &config)?;
    println!("Session saved to {}", args.out.display());
    Ok(code)
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let config = resolve_config(&args.service)?;
    let result = analyze_file(&config, &args.image, args.prompt.as_deref())?;
    print_analysis(&result);
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    export_html(&args.run, &args.out)?;
    println!("Exported to {}", args.out.display());
    Ok(0)
}

/// A refined-prompt analysis leaves the new prompt in place without
/// generating it; returns that prompt when one is waiting.
fn refined_prompt_pending(controller: &RefinementController) -> Option<String> {
    if controller.plan().is_some() {
        return None;
    }
    let last = controller.history().last()?;
    (last.prompt != controller.prompt()).then(|| controller.prompt().to_string())
}

fn analyze_file(
    config: &EngineConfig,
    path: &Path,
    prompt: Option<&str>,
) -> Result<AnalysisResult> {
    let image = load_image_file(path)?;
    let analyzer = config.analyzer()?;
    analyzer
        .analyze(&image, prompt, &CancelToken::new())
        .with_context(|| format!("failed to analyze {}", path.display()))
}

fn load_image_file(path: &Path) -> Result<ImageBytes> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let format = image::guess_format(&bytes)
        .with_context(|| format!("{} is not a recognized image", path.display()))?;
    Ok(ImageBytes {
        bytes,
        mime_type: Some(format.to_mime_type().to_string()),
    })
}

fn wait_with_progress(session: &mut Session, interrupt: &AtomicBool) -> Result<Settled> {
    let mut last_line = String::new();
    while session.controller().is_busy() {
        if interrupt.swap(false, Ordering::SeqCst) {
            session.reset()?;
            return Ok(Settled::Interrupted);
        }
        if let Some(line) = progress_line(session.controller()) {
            if line != last_line {
                println!("{line}");
                last_line = line;
            }
        }
        session.pump(POLL_INTERVAL)?;
    }
    Ok(match session.controller().state() {
        State::AwaitingSelection { .. } => Settled::AwaitingSelection,
        _ => Settled::Idle,
    })
}

fn progress_line(controller: &RefinementController) -> Option<String> {
    match controller.state() {
        State::Generating => Some("Generating image...".to_string()),
        State::AwaitingAnalysis => Some(format!(
            "Analyzing image{}...",
            current_image_path(controller)
                .map(|path| format!(" ({path})"))
                .unwrap_or_default()
        )),
        State::GeneratingOptions { step, slots } => {
            let done = slots.iter().filter(|slot| slot.image.is_some()).count();
            let detail = controller
                .current_step()
                .map(|row| row.detail.as_str())
                .unwrap_or_default();
            Some(format!(
                "Generating options for '{detail}' (step {}, {done}/{} ready)...",
                step + 1,
                slots.len()
            ))
        }
        State::Idle | State::AwaitingSelection { .. } => None,
    }
}

fn report_settled(session: &mut Session, settled: Settled) {
    match settled {
        Settled::Interrupted => println!("Cancelled."),
        Settled::AwaitingSelection => print_options(session.controller()),
        Settled::Idle => {
            let controller = session.controller();
            if let Some(err) = controller.last_error() {
                eprintln!("!! {err}");
                session.controller_mut().dismiss_error();
                return;
            }
            if let Some(path) = current_image_path(controller) {
                println!("Image: {path}");
            }
            if let Some(notice) = controller.notice() {
                println!("{notice}");
            }
            if let Some(description) = controller.description() {
                println!("Description: {description}");
            }
            if !controller.sections().is_empty() {
                println!("Suggested details:");
                for section in controller.sections() {
                    println!("  {}: {}", section.parameter, section.details.join(", "));
                }
            }
            if controller.plan_complete() {
                println!("Plan complete. Prompt: {}", controller.prompt());
            } else if refined_prompt_pending(controller).is_some() {
                println!("Refined prompt: {}", controller.prompt());
            }
        }
    }
}

fn current_image_path(controller: &RefinementController) -> Option<String> {
    let handle = controller.current_image()?;
    controller
        .images()
        .path(handle)
        .map(|path| path.display().to_string())
}

fn print_options(controller: &RefinementController) {
    let detail = controller
        .current_step()
        .map(|step| step.detail.clone())
        .unwrap_or_default();
    println!("Choose a value for '{detail}' with /pick N:");
    for (idx, option) in controller.options().iter().enumerate() {
        let path = controller
            .images()
            .path(&option.image)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| option.image.to_string());
        println!("  [{}] {} -> {}", idx + 1, option.option, path);
    }
}

fn print_plan(controller: &RefinementController) {
    let Some(plan) = controller.plan() else {
        println!("No refinement plan yet.");
        return;
    };
    if plan.is_empty() {
        println!("The refinement plan is empty.");
        return;
    }
    for (idx, step) in plan.steps().iter().enumerate() {
        let marker = if idx < controller.step_index() {
            "x"
        } else if idx == controller.step_index() && !controller.plan_complete() {
            ">"
        } else {
            " "
        };
        println!("  [{marker}] {}: {}", step.detail, step.options.join(" | "));
    }
}

fn print_history(controller: &RefinementController) {
    if controller.history().is_empty() {
        println!("No history yet.");
        return;
    }
    for (idx, entry) in controller.history().iter().enumerate() {
        match (&entry.detail, &entry.detail_value) {
            (Some(detail), Some(value)) => {
                println!("  {idx}. {detail} = {value}: {}", entry.prompt)
            }
            _ => println!("  {idx}. {}", entry.prompt),
        }
    }
}

fn print_status(session: &Session, config: &EngineConfig) {
    let controller = session.controller();
    println!("State: {}", controller.state().label());
    println!("Prompt: {}", controller.prompt());
    println!(
        "Plan step: {}/{}",
        controller.step_index(),
        controller.plan().map(|plan| plan.len()).unwrap_or(0)
    );
    println!("History entries: {}", controller.history().len());
    if let Some(path) = current_image_path(controller) {
        println!("Current image: {path}");
    }
    println!(
        "Generator: {} ({}), steps {}, guidance {}",
        session.generator_name(),
        config.generate_url,
        config.generation.steps,
        config.generation.guidance
    );
    println!(
        "Analyzer: {} ({}/{})",
        session.analyzer_name(),
        config.analyze_url,
        config.endpoint
    );
    if let Some(err) = controller.last_error() {
        println!("Last error: {err}");
    }
}

fn print_analysis(result: &AnalysisResult) {
    match result {
        AnalysisResult::Text(text) => println!("Description: {text}"),
        AnalysisResult::RefinedPrompt(prompt) => println!("Refined prompt: {prompt}"),
        AnalysisResult::Sections(sections) => {
            for section in sections {
                println!("{}: {}", section.parameter, section.details.join(", "));
            }
        }
        AnalysisResult::Plan(plan) => {
            for (idx, step) in plan.steps().iter().enumerate() {
                println!("{}. {}: {}", idx + 1, step.detail, step.options.join(" | "));
            }
        }
        AnalysisResult::None => println!("No suggestion available."),
    }
}

fn export_html(run_dir: &Path, out_path: &Path) -> Result<()> {
    let history_path = run_dir.join("history.json");
    if !history_path.exists() {
        bail!("no history.json in {}", run_dir.display());
    }
    let record = SessionRecord::load(history_path);

    let mut cards = String::new();
    for (idx, row) in record.entries.iter().enumerate() {
        let entry = &row.entry;
        let image_src = row
            .image_path
            .as_deref()
            .and_then(|path| image_data_url(Path::new(path)))
            .unwrap_or_default();
        let label = match (&entry.detail, &entry.detail_value) {
            (Some(detail), Some(value)) => format!("{detail}: {value}"),
            _ => "initial".to_string(),
        };
        let diff = row
            .prompt_diff
            .as_ref()
            .map(|lines| lines.join("\n"))
            .unwrap_or_default();
        cards.push_str(&format!(
            "<div class='card'><div class='thumb'><img src='{image_src}' alt='step {idx}'></div><div class='meta'><div class='step'>{idx}. {label}</div><div class='prompt'>{prompt}</div><pre class='diff'>{diff}</pre></div></div>",
            image_src = escape_html(&image_src),
            label = escape_html(&label),
            prompt = escape_html(&entry.prompt),
            diff = escape_html(&diff),
        ));
    }

    let session_id = escape_html(&record.session_id);
    let html_doc = format!(
        "<!doctype html>\n<html>\n<head>\n  <meta charset='utf-8'>\n  <title>Dasher Export</title>\n  <style>\n    body {{ font-family: Arial, sans-serif; background: #f6f6f6; margin: 0; padding: 20px; }}\n    .grid {{ display: grid; grid-template-columns: repeat(auto-fill, minmax(240px, 1fr)); gap: 16px; }}\n    .card {{ background: white; border-radius: 10px; overflow: hidden; box-shadow: 0 2px 8px rgba(0,0,0,0.08); }}\n    .thumb {{ width: 100%; height: 200px; background: #eee; display: flex; align-items: center; justify-content: center; }}\n    .thumb img {{ max-width: 100%; max-height: 100%; }}\n    .meta {{ padding: 10px; }}\n    .step {{ font-weight: bold; font-size: 12px; color: #444; }}\n    .prompt {{ font-size: 13px; margin: 8px 0; }}\n    .diff {{ font-size: 11px; color: #666; white-space: pre-wrap; }}\n  </style>\n</head>\n<body>\n  <h1>Dasher Session {session_id}</h1>\n  <div class='grid'>\n    {cards}\n  </div>\n</body>\n</html>\n"
    );

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out_path, html_doc)
        .with_context(|| format!("failed to write {}", out_path.display()))?;
    Ok(())
}

fn image_data_url(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let mime = image::guess_format(&bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/png");
    Some(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    non_empty(value.and_then(Value::as_str))
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;
    use dasher_contracts::events::read_event_types;

    use super::*;

    fn dryrun_config() -> EngineConfig {
        EngineConfig {
            dryrun: true,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn cli_parses_run_with_service_overrides() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "dasher",
            "run",
            "--prompt",
            "a red car",
            "--out",
            "runs/one",
            "--pick",
            "last",
            "--endpoint",
            "analyze-for-detail",
            "--steps",
            "6",
            "--dryrun",
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.prompt, "a red car");
        assert_eq!(args.rounds, 1);

        let mut config = EngineConfig::default();
        apply_service_args(&mut config, &args.service)?;
        assert_eq!(config.endpoint, AnalysisEndpoint::AnalyzeForDetail);
        assert_eq!(config.generation.steps, 6);
        assert!(config.dryrun);
        Ok(())
    }

    #[test]
    fn bad_service_overrides_are_rejected() {
        let mut config = EngineConfig::default();
        let endpoint = ServiceArgs {
            endpoint: Some("describe".to_string()),
            ..ServiceArgs::default()
        };
        let err = apply_service_args(&mut config, &endpoint).err();
        assert!(err
            .map(|err| err.to_string().contains("get-refinement-plan"))
            .unwrap_or(false));

        let steps = ServiceArgs {
            steps: Some(0),
            ..ServiceArgs::default()
        };
        assert!(apply_service_args(&mut config, &steps).is_err());
    }

    #[test]
    fn escape_html_covers_markup_characters() {
        assert_eq!(
            escape_html("<a href='x'>\"&\"</a>"),
            "&lt;a href=&#x27;x&#x27;&gt;&quot;&amp;&quot;&lt;/a&gt;"
        );
    }

    #[test]
    fn recorder_persists_history_and_summary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let config = dryrun_config();
        let mut recorder = SessionRecorder::open(&out)?;
        let events_path = out.join("events.jsonl");
        let mut session = open_session(&config, &out, &events_path, recorder.session_id())?
            .with_poll_interval(Duration::from_millis(10));

        recorder.note_submit();
        let settled = session.run_auto("a red car", PickStrategy::First, &|| false)?;
        assert_eq!(settled, Settled::Idle);
        assert_eq!(recorder.sync(session.controller())?, 4);
        assert_eq!(recorder.sync(session.controller())?, 0);
        recorder.finish(session.controller(), &config)?;

        let record = SessionRecord::load(out.join("history.json"));
        assert_eq!(record.entries.len(), 4);
        assert!(record.entries[0].prompt_diff.is_none());
        assert!(record.entries[1].prompt_diff.is_some());
        let first_image = record.entries[0].image_path.clone().unwrap_or_default();
        assert!(Path::new(&first_image).exists());

        let summary: Value = serde_json::from_str(&fs::read_to_string(out.join("summary.json"))?)?;
        assert_eq!(summary["rounds_submitted"], json!(1));
        assert_eq!(summary["total_images"], json!(4));
        assert_eq!(summary["selections"][0]["detail"], json!("lighting"));
        assert_eq!(summary["dryrun"], json!(true));

        let events = read_event_types(&events_path)?;
        assert_eq!(events.first().map(String::as_str), Some("round_submitted"));
        assert_eq!(events.last().map(String::as_str), Some("plan_completed"));
        Ok(())
    }

    #[test]
    fn export_embeds_recorded_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("run");
        let config = dryrun_config();
        let mut recorder = SessionRecorder::open(&out)?;
        let events_path = out.join("events.jsonl");
        let mut session = open_session(&config, &out, &events_path, recorder.session_id())?
            .with_poll_interval(Duration::from_millis(10));
        session.run_auto("a <small> boat", PickStrategy::Last, &|| false)?;
        recorder.finish(session.controller(), &config)?;

        let html_path = temp.path().join("export/index.html");
        export_html(&out, &html_path)?;
        let html = fs::read_to_string(html_path)?;
        assert!(html.contains("data:image/png;base64,"));
        assert!(html.contains("a &lt;small&gt; boat"));
        assert!(html.contains("lighting: neon"));
        assert!(export_html(&temp.path().join("missing"), &temp.path().join("x.html")).is_err());
        Ok(())
    }

    #[test]
    fn sections_analysis_leaves_no_pending_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = EngineConfig {
            endpoint: AnalysisEndpoint::Analyze,
            ..dryrun_config()
        };
        let mut session = open_session(&config, temp.path(), &temp.path().join("e.jsonl"), "s")?
            .with_poll_interval(Duration::from_millis(10));
        session.run_auto("a lamp", PickStrategy::First, &|| false)?;
        assert!(refined_prompt_pending(session.controller()).is_none());
        assert_eq!(session.controller().sections().len(), 3);
        Ok(())
    }

    #[test]
    fn load_image_file_detects_format() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("pixel.png");
        image::RgbImage::from_pixel(1, 1, image::Rgb([1, 2, 3])).save(&path)?;
        let loaded = load_image_file(&path)?;
        assert_eq!(loaded.mime_type.as_deref(), Some("image/png"));

        let text = temp.path().join("notes.txt");
        fs::write(&text, "hello")?;
        assert!(load_image_file(&text).is_err());
        Ok(())
    }
}
