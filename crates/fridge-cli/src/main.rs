use std::fs;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fridge_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use fridge_contracts::conversation::{CameraImage, Turn};
use fridge_contracts::events::EventWriter;
use fridge_contracts::models::{ModelSelection, ModelSelector, ModelSpec};
use fridge_engine::config::{
    DEFAULT_CAMERA_TIMEOUT, DEFAULT_MODEL_TIMEOUT, DEFAULT_SECRETS_PATH,
};
use fridge_engine::prompts::load_system_instruction;
use fridge_engine::{
    error_chain_text, load_config, ConfigError, ConfigSource, FridgeConfig, FridgeSession,
    GeminiClient, LiteralSecrets, SessionOptions, TurnReport,
};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "fridge-rs",
    version,
    about = "Chat with an AI about what is in your fridge"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat; every question carries a fresh fridge photo.
    Chat(ChatArgs),
    /// Ask one question and print the reply.
    Ask(AskArgs),
    /// Fetch one camera frame and save it.
    Snap(SnapArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConfigSourceKind {
    Literal,
    File,
    Env,
}

impl ConfigSourceKind {
    fn as_str(self) -> &'static str {
        match self {
            ConfigSourceKind::Literal => "literal",
            ConfigSourceKind::File => "file",
            ConfigSourceKind::Env => "env",
        }
    }
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Defaults to `literal` when any secret flag is given, `env` otherwise.
    #[arg(long, value_enum)]
    config_source: Option<ConfigSourceKind>,
    #[arg(long, default_value = DEFAULT_SECRETS_PATH)]
    secrets: PathBuf,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    camera_url: Option<String>,
    #[arg(long)]
    bucket: Option<String>,
    #[arg(long)]
    object_key: Option<String>,
    #[arg(long)]
    storage_base_url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Gemini endpoint root; falls back to GEMINI_API_BASE.
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    resend_history: bool,
    #[arg(long, default_value_t = DEFAULT_CAMERA_TIMEOUT.as_secs())]
    camera_timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MODEL_TIMEOUT.as_secs())]
    model_timeout_secs: u64,
    #[arg(long)]
    system_instruction: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    snapshots: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    prompt: String,
}

#[derive(Debug, Parser)]
struct SnapArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    out: PathBuf,
}

const VISION_CAPABILITY: &str = "vision";
const THUMBNAIL_WIDTH: u32 = 300;
const ERROR_TEXT_MAX_CHARS: usize = 600;
const CONFIG_ERROR_EXIT: i32 = 2;
const FAILURE_EXIT: i32 = 1;

/// A ready session plus what is needed to rebuild its model client.
struct App {
    session: FridgeSession,
    config: FridgeConfig,
    options: SessionOptions,
    selector: ModelSelector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatFlow {
    Continue,
    Quit,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fridge-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut err = io::stderr();
    match cli.command {
        Command::Chat(args) => run_chat(&args, &mut io::stdin().lock(), &mut out, &mut err),
        Command::Ask(args) => run_ask(&args, &mut out, &mut err),
        Command::Snap(args) => run_snap(&args, &mut out, &mut err),
    }
}

fn run_chat(
    args: &ChatArgs,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<i32> {
    let mut app = match open_app(&args.common, err)? {
        Ok(app) => app,
        Err(config_err) => return report_config_error(&config_err, err),
    };
    if let Some(dir) = args.snapshots.as_deref() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed creating snapshot dir {}", dir.display()))?;
    }

    writeln!(out, "Smart Fridge Chat")?;
    writeln!(out, "Ask about your fridge's contents. Type /help for commands.")?;

    let mut line = String::new();
    loop {
        write!(out, "> ")?;
        out.flush()?;

        line.clear();
        let read = match input.read_line(&mut line) {
            Ok(read) => read,
            Err(read_err) if read_err.kind() == ErrorKind::Interrupted => continue,
            Err(read_err) => return Err(read_err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        if dispatch(&mut app, &intent, args.snapshots.as_deref(), out)? == ChatFlow::Quit {
            break;
        }
    }

    app.session.finish();
    Ok(0)
}

/// Handles one chat line. Only failures writing to `out` propagate.
fn dispatch(
    app: &mut App,
    intent: &Intent,
    snapshots: Option<&Path>,
    out: &mut dyn Write,
) -> Result<ChatFlow> {
    match intent.action.as_str() {
        "noop" => {}
        "help" => {
            writeln!(out, "Commands: {}", CHAT_HELP_COMMANDS.join(" "))?;
            writeln!(out, "Anything else is sent to the model with a fresh fridge photo.")?;
        }
        "history" => {
            if app.session.conversation().is_empty() {
                writeln!(out, "No turns yet.")?;
            }
            for turn in app.session.conversation().iter() {
                writeln!(out, "{}", render_turn(turn))?;
            }
        }
        "show_config" => {
            for entry in config_lines(app) {
                writeln!(out, "{entry}")?;
            }
        }
        "list_models" => {
            for spec in app.selector.registry.list() {
                writeln!(out, "{}", model_line(spec, app.session.model_name()))?;
            }
        }
        "set_model" => match intent.arg_str("model") {
            Some(requested) => match app.selector.select(Some(requested), VISION_CAPABILITY) {
                Ok(selection) => {
                    app.switch_model(&selection, out)?;
                    writeln!(out, "Model set to {}", app.session.model_name())?;
                }
                Err(message) => writeln!(out, "{message}")?,
            },
            None => writeln!(out, "Model: {}", app.session.model_name())?,
        },
        "snap" => match app.session.snapshot() {
            Ok(image) => {
                writeln!(out, "{}", render_image(&image))?;
                if let Some(path) = intent.arg_str("path") {
                    let path = Path::new(path);
                    match write_frame(&image, path) {
                        Ok(()) => writeln!(out, "Saved {}", path.display())?,
                        Err(save_err) => writeln!(out, "Snapshot save failed: {save_err:#}")?,
                    }
                }
            }
            Err(camera_err) => writeln!(
                out,
                "Camera warning: {}",
                error_chain_text(&camera_err, ERROR_TEXT_MAX_CHARS)
            )?,
        },
        "quit" => return Ok(ChatFlow::Quit),
        "unknown" => {
            let command = intent.arg_str("command").unwrap_or_default();
            writeln!(out, "Unknown command: /{command}. Type /help for commands.")?;
        }
        _ => {
            if let Some(prompt) = intent.prompt.as_deref() {
                let report = app.session.run_turn(prompt);
                print_report(&app.session, &report, snapshots, out)?;
            }
        }
    }
    Ok(ChatFlow::Continue)
}

fn run_ask(args: &AskArgs, out: &mut dyn Write, err: &mut dyn Write) -> Result<i32> {
    let prompt = args.prompt.trim();
    if prompt.is_empty() {
        bail!("--prompt must not be empty");
    }
    let mut app = match open_app(&args.common, err)? {
        Ok(app) => app,
        Err(config_err) => return report_config_error(&config_err, err),
    };

    let report = app.session.run_turn(prompt);
    print_report(&app.session, &report, None, out)?;
    app.session.finish();
    Ok(ask_exit_code(&report))
}

fn ask_exit_code(report: &TurnReport) -> i32 {
    if report.answered() {
        0
    } else {
        FAILURE_EXIT
    }
}

fn run_snap(args: &SnapArgs, out: &mut dyn Write, err: &mut dyn Write) -> Result<i32> {
    let app = match open_app(&args.common, err)? {
        Ok(app) => app,
        Err(config_err) => return report_config_error(&config_err, err),
    };

    let result = app.session.snapshot();
    app.session.finish();
    let image = match result {
        Ok(image) => image,
        Err(camera_err) => {
            writeln!(
                err,
                "Camera warning: {}",
                error_chain_text(&camera_err, ERROR_TEXT_MAX_CHARS)
            )?;
            return Ok(FAILURE_EXIT);
        }
    };
    write_frame(&image, &args.out)?;
    writeln!(out, "{}", render_image(&image))?;
    writeln!(out, "Saved {}", args.out.display())?;
    Ok(0)
}

/// Outer error: local I/O or bad flags. Inner error: configuration,
/// reported to the user instead of aborting.
fn open_app(common: &CommonArgs, err: &mut dyn Write) -> Result<Result<App, ConfigError>> {
    let config = match load_config(&config_source(common)?) {
        Ok(config) => config,
        Err(config_err) => return Ok(Err(config_err)),
    };

    let selector = ModelSelector::new(None);
    let selection = selector
        .select(common.model.as_deref(), VISION_CAPABILITY)
        .map_err(anyhow::Error::msg)?;
    if let Some(note) = selection.note.as_deref() {
        if common.model.is_some() {
            writeln!(err, "{note}")?;
        }
    }

    let mut options = SessionOptions {
        model: selection.model.name.clone(),
        resend_history: common.resend_history,
        camera_timeout: Duration::from_secs(common.camera_timeout_secs.max(1)),
        model_timeout: Duration::from_secs(common.model_timeout_secs.max(1)),
        ..SessionOptions::default()
    };
    if let Some(base) = common.api_base.as_deref().map(str::trim) {
        if !base.is_empty() {
            options.api_base = base.trim_end_matches('/').to_string();
        }
    }
    if let Some(path) = common.system_instruction.as_deref() {
        options.system_instruction = load_system_instruction(path)?;
    }

    let mut session = match FridgeSession::from_config(&config, &options) {
        Ok(session) => session,
        Err(config_err) => return Ok(Err(config_err)),
    };
    if let Some(path) = common.events.as_deref() {
        let events = EventWriter::open_new_session(path)?;
        info!(path = %path.display(), session_id = events.session_id(), "writing session events");
        session = session.with_events(events);
    }

    Ok(Ok(App {
        session,
        config,
        options,
        selector,
    }))
}

impl App {
    fn switch_model(&mut self, selection: &ModelSelection, out: &mut dyn Write) -> Result<()> {
        if let Some(note) = selection.note.as_deref() {
            writeln!(out, "{note}")?;
        }
        self.options.model = selection.model.name.clone();
        self.session.replace_model(Box::new(GeminiClient::new(
            self.config.api_key.clone(),
            self.options.model.clone(),
            self.options.api_base.clone(),
            self.options.model_timeout,
        )));
        Ok(())
    }
}

/// Secret flags only make sense for the literal source, so giving one
/// picks it and combining one with another source is rejected.
fn config_source(common: &CommonArgs) -> Result<ConfigSource> {
    let secret_flags: Vec<&str> = [
        ("--api-key", common.api_key.is_some()),
        ("--camera-url", common.camera_url.is_some()),
        ("--bucket", common.bucket.is_some()),
        ("--object-key", common.object_key.is_some()),
        ("--storage-base-url", common.storage_base_url.is_some()),
    ]
    .into_iter()
    .filter_map(|(flag, given)| given.then_some(flag))
    .collect();

    let kind = common.config_source.unwrap_or(if secret_flags.is_empty() {
        ConfigSourceKind::Env
    } else {
        ConfigSourceKind::Literal
    });
    if kind != ConfigSourceKind::Literal && !secret_flags.is_empty() {
        bail!(
            "{} cannot be combined with --config-source {}; use --config-source literal",
            secret_flags.join(", "),
            kind.as_str()
        );
    }

    Ok(match kind {
        ConfigSourceKind::Literal => ConfigSource::Literal(LiteralSecrets {
            api_key: common.api_key.clone(),
            camera_url: common.camera_url.clone(),
            bucket: common.bucket.clone(),
            object_key: common.object_key.clone(),
            storage_base_url: common.storage_base_url.clone(),
        }),
        ConfigSourceKind::File => ConfigSource::SecretsFile(common.secrets.clone()),
        ConfigSourceKind::Env => ConfigSource::Environment,
    })
}

fn report_config_error(config_err: &ConfigError, err: &mut dyn Write) -> Result<i32> {
    writeln!(err, "{}", config_warning(config_err))?;
    Ok(CONFIG_ERROR_EXIT)
}

fn config_warning(err: &ConfigError) -> String {
    let detail = error_chain_text(err, ERROR_TEXT_MAX_CHARS);
    match err {
        ConfigError::MissingApiKey => format!(
            "Please provide a Gemini API key to use this app ({detail}). The chat stays disabled until one is configured."
        ),
        _ => format!("Configuration error: {detail}. The chat stays disabled until this is fixed."),
    }
}

fn config_lines(app: &App) -> Vec<String> {
    vec![
        format!("Camera: {}", app.session.camera_description()),
        format!("Model: {}", app.session.model_name()),
        format!("API key: {}", app.config.api_key.masked()),
        format!(
            "Resend history: {}",
            if app.session.resend_history() { "on" } else { "off" }
        ),
        format!(
            "Timeouts: camera {}s, model {}s",
            app.options.camera_timeout.as_secs(),
            app.options.model_timeout.as_secs()
        ),
    ]
}

fn model_line(spec: &ModelSpec, current: &str) -> String {
    let marker = if spec.name == current { "*" } else { " " };
    let mut details = spec.capabilities.join(", ");
    if let Some(tokens) = spec.context_window {
        details.push_str(&format!("; {} context", format_tokens(tokens)));
    }
    format!("{marker} {} ({details})", spec.name)
}

fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M tokens", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{}k tokens", tokens / 1_000)
    } else {
        format!("{tokens} tokens")
    }
}

fn print_report(
    session: &FridgeSession,
    report: &TurnReport,
    snapshots: Option<&Path>,
    out: &mut dyn Write,
) -> Result<()> {
    let mut turns = report
        .appended
        .iter()
        .filter_map(|index| session.conversation().get(*index).map(|turn| (*index, turn)));

    if let Some((_, first)) = turns.next() {
        writeln!(out, "{}", render_turn(first))?;
    }
    if let Some(camera_err) = report.camera_warning.as_ref() {
        writeln!(
            out,
            "Camera warning: {}",
            error_chain_text(camera_err, ERROR_TEXT_MAX_CHARS)
        )?;
    }
    for (index, turn) in turns {
        writeln!(out, "{}", render_turn(turn))?;
        if let (Some(dir), Some(image)) = (snapshots, turn.image()) {
            let path = dir.join(format!("turn-{index:04}.jpg"));
            if let Err(save_err) = save_thumbnail(image, &path) {
                warn!(path = %path.display(), error = %format!("{save_err:#}"), "failed to save thumbnail");
            }
        }
    }
    if let Some(model_err) = report.model_error.as_ref() {
        writeln!(
            out,
            "AI Error: {}",
            error_chain_text(model_err, ERROR_TEXT_MAX_CHARS)
        )?;
    }
    Ok(())
}

fn render_turn(turn: &Turn) -> String {
    match turn.image() {
        Some(image) => format!("{}> {}", turn.role(), render_image(image)),
        None => format!("{}> {}", turn.role(), turn.text()),
    }
}

fn render_image(image: &CameraImage) -> String {
    format!(
        "[camera view {}x{} {}]",
        image.width(),
        image.height(),
        image.mime_type()
    )
}

/// Writes the frame exactly as the camera sent it.
fn write_frame(image: &CameraImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(path, image.bytes()).with_context(|| format!("failed writing {}", path.display()))
}

fn save_thumbnail(image: &CameraImage, path: &Path) -> Result<()> {
    let resized = thumbnail(image.decoded());
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 85);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(resized.to_rgb8()))
        .context("failed encoding thumbnail")?;
    fs::write(path, bytes).with_context(|| format!("failed writing {}", path.display()))
}

fn thumbnail(image: &DynamicImage) -> DynamicImage {
    let width = image.width().max(1);
    let height = ((u64::from(image.height()) * u64::from(THUMBNAIL_WIDTH)) / u64::from(width))
        .max(1) as u32;
    image.resize_exact(THUMBNAIL_WIDTH, height, FilterType::Triangle)
}
