mod commands;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use worm_core::catalog::{DEFAULT_CATALOG_FILE, ResponseCatalog};
use worm_core::config::{DEFAULT_SETTINGS_FILE, Settings, WormCfg};
use worm_core::io::speech::{CommandSpeech, SimulatedSpeech, SpeechPacing, SpeechService};
use worm_core::io::transport::{MotorSink, SerialTransport};
use worm_core::resolver::{GenerativeFallback, ResolveMode, ResponseResolver};
use worm_core::runtime::Runtime;
use worm_core::types::SymbolicCommand;
use worm_llm::provider::LlmProvider;

/// Talk to the animatronic worm.
#[derive(Parser)]
#[command(name = "worm", version, about)]
struct Cli {
    /// Settings file (JSON).
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE, env = "WORM_SETTINGS")]
    settings: PathBuf,

    /// Response catalog (JSON).
    #[arg(long, global = true, default_value = DEFAULT_CATALOG_FILE, env = "WORM_CATALOG")]
    catalog: PathBuf,

    /// Log JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive session (the default).
    Run(RunArgs),

    /// Send one movement token to the controller, e.g. `identify`.
    Send {
        token: SymbolicCommand,
        /// Serial device; auto-detected when omitted.
        #[arg(long)]
        port: Option<String>,
    },

    /// Read or change settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Show catalog, transport, speech and generative configuration.
    Status,

    /// List canned responses.
    Responses {
        #[arg(long)]
        category: Option<String>,
    },

    /// Add a canned response to the catalog file.
    AddResponse {
        category: String,
        text: String,
        #[arg(long)]
        subcategory: Option<String>,
        #[arg(long)]
        movement: Option<SymbolicCommand>,
        /// Exact trigger phrase (required for `custom`).
        #[arg(long)]
        trigger: Option<String>,
        #[arg(long)]
        emotion: Option<String>,
        #[arg(long)]
        pulses: Option<u32>,
    },

    /// Remove a canned response by its index in `worm responses`.
    RemoveResponse {
        category: String,
        index: usize,
        #[arg(long)]
        subcategory: Option<String>,
    },
}

#[derive(clap::Args, Default)]
struct RunArgs {
    /// Start listening right away.
    #[arg(long, conflicts_with = "text")]
    voice: bool,

    /// Start in typing mode (the default).
    #[arg(long)]
    text: bool,

    /// Serial device of the motor controller.
    #[arg(long)]
    port: Option<String>,

    /// Do not look for a controller; log every command instead.
    #[arg(long)]
    simulate: bool,

    /// Seed for response picks (reproducible sessions).
    #[arg(long)]
    seed: Option<u64>,

    /// TTS program template, e.g. "espeak -s {rate} -a {volume} {text}".
    #[arg(long)]
    speech_command: Option<String>,

    /// STT program printing one utterance per line.
    #[arg(long)]
    stt_command: Option<String>,

    /// Never call the generative provider.
    #[arg(long)]
    canned: bool,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print one dotted key, or the whole document.
    Get { key: Option<String> },
    /// Set a dotted key; the value is parsed as JSON when possible.
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut settings = Settings::load_or_default(&cli.settings);
    let cfg = WormCfg::from_settings(&settings).with_env_overrides();

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run_session(cfg, &cli.catalog, args).await,
        Command::Send { token, port } => {
            let cfg = WormCfg {
                serial_port: port.or(cfg.serial_port),
                ..cfg
            };
            let transport = connect(cfg).await?;
            commands::send(&transport, token)
        }
        Command::Settings { action } => match action {
            SettingsAction::Get { key } => commands::settings_get(&settings, key.as_deref()),
            SettingsAction::Set { key, value } => commands::settings_set(&mut settings, &key, &value),
        },
        Command::Status => {
            let catalog = ResponseCatalog::load_or_default(&cli.catalog);
            let llm = worm_llm::http::from_env();
            commands::status(commands::StatusReport {
                catalog_path: &cli.catalog,
                catalog: &catalog,
                settings: &settings,
                cfg: &cfg,
                llm: llm.as_ref().map(|p| p.name()),
            });
            Ok(())
        }
        Command::Responses { category } => {
            let catalog = ResponseCatalog::load_or_default(&cli.catalog);
            commands::list_responses(&catalog, category.as_deref())
        }
        Command::AddResponse {
            category,
            text,
            subcategory,
            movement,
            trigger,
            emotion,
            pulses,
        } => commands::add_response(
            &cli.catalog,
            commands::NewResponse {
                category: &category,
                subcategory: subcategory.as_deref(),
                text: &text,
                movement,
                trigger: trigger.as_deref(),
                emotion: emotion.as_deref(),
                pulses,
            },
        ),
        Command::RemoveResponse {
            category,
            index,
            subcategory,
        } => commands::remove_response(&cli.catalog, &category, subcategory.as_deref(), index),
    }
}

/// Human-readable lines on stderr by default, JSON lines with `--log-json`.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("worm=info,worm_core=info,worm_llm=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_session(cfg: WormCfg, catalog_path: &std::path::Path, args: RunArgs) -> anyhow::Result<()> {
    let cfg = WormCfg {
        serial_port: args.port.or(cfg.serial_port),
        simulation_mode: cfg.simulation_mode || args.simulate,
        speech_command: args.speech_command.or(cfg.speech_command),
        listener_command: args.stt_command.or(cfg.listener_command),
        ..cfg
    };

    let catalog = Arc::new(ResponseCatalog::load_or_default(catalog_path));
    tracing::info!(responses = catalog.response_count(), path = %catalog_path.display(), "catalog loaded");

    let resolver = match args.seed {
        Some(seed) => ResponseResolver::seeded(catalog, cfg.keyword_table.clone(), seed),
        None => ResponseResolver::new(catalog, cfg.keyword_table.clone()),
    };
    // LLM provider from env vars
    let llm: Option<Arc<dyn LlmProvider>> = if cfg.use_ai_fallback && !args.canned {
        worm_llm::http::from_env().map(|p| {
            tracing::info!(name = p.name(), "LLM provider initialized");
            Arc::new(p) as _
        })
    } else {
        None
    };
    let resolve_mode = if llm.is_some() {
        ResolveMode::Generative
    } else {
        ResolveMode::Canned
    };
    let resolver = match llm {
        Some(provider) => resolver.with_generative(
            GenerativeFallback::new(provider, &cfg),
            cfg.ai_confidence_threshold,
        ),
        None => resolver,
    };

    let speech: Arc<dyn SpeechService> = match cfg.speech_command.as_deref() {
        Some(template) => Arc::new(
            CommandSpeech::new(template, &cfg).context("invalid speech command")?,
        ),
        None => Arc::new(SimulatedSpeech::new(SpeechPacing::WordsPerMinute(cfg.speech_rate))),
    };
    let motor: Arc<dyn MotorSink> = Arc::new(connect(cfg.clone()).await?);

    let (runtime, input_tx, output_rx) = Runtime::new(&cfg, resolver, motor, speech);
    let mut runtime = runtime
        .with_resolve_mode(resolve_mode)
        .with_voice_start(args.voice);
    if let Some(command) = cfg.listener_command.as_deref() {
        runtime = runtime.with_listener_command(command);
    }
    let token = runtime.token();

    // Run both futures on this task. Whichever ends first cancels the other,
    // then the runtime is always awaited so its shutdown path completes.
    let runtime_fut = runtime.run();
    let repl_fut = repl::run(input_tx, output_rx, token.clone());
    tokio::pin!(runtime_fut);
    tokio::pin!(repl_fut);

    tokio::select! {
        _ = &mut runtime_fut => {
            token.cancel();
            (&mut repl_fut).await
        }
        result = &mut repl_fut => {
            token.cancel();
            (&mut runtime_fut).await;
            result
        }
    }
}

/// Opening the port sleeps through the controller's boot delay, so it runs
/// on the blocking pool.
async fn connect(cfg: WormCfg) -> anyhow::Result<SerialTransport> {
    if cfg.simulation_mode {
        tracing::info!("simulation mode forced, not opening a serial port");
        return Ok(SerialTransport::simulated());
    }
    tokio::task::spawn_blocking(move || SerialTransport::connect(&cfg))
        .await
        .context("serial connect task failed")
}
