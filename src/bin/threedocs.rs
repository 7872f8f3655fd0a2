//! CLI binary for threedocs.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use threedocs::pipeline::engine;
use threedocs::{
    AssetKind, ContentHash, FishAudioConfig, Pipeline, PipelineConfig, PipelineProgressCallback,
    ProcessReport, ProgressCallback, Stage, StepStore, TripoConfig,
};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a spinner while the manual is hashed,
/// extracted and analyzed, then a bar over the pending asset files. Asset
/// events arrive out of order from two concurrent groups.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Generating");
        self.bar.reset_eta();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage(&self, stage: Stage) {
        if stage != Stage::GeneratingAssets {
            self.bar.set_prefix(stage.to_string());
            self.bar.set_message("");
        }
    }

    fn on_cache_hit(&self, pdf_hash: &str, steps: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Already processed ({pdf_hash}): {steps} steps"))
        ));
    }

    fn on_assets_start(&self, pending: usize) {
        if pending > 0 {
            self.activate_bar(pending);
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!("Generating {pending} asset files…"))
            ));
        }
    }

    fn on_asset_complete(&self, kind: AssetKind, step: u32, filename: &str) {
        self.bar.println(format!(
            "  {} Step {:>3}  {:<6} {}",
            green("✓"),
            step,
            kind,
            dim(filename)
        ));
        self.bar.inc(1);
    }

    fn on_asset_error(&self, kind: AssetKind, step: u32, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Step {:>3}  {:<6} {}",
            red("✗"),
            step,
            kind,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_complete(&self, steps: usize, failures: usize) {
        self.bar.finish_and_clear();

        if failures == 0 {
            eprintln!(
                "{} {} steps ready",
                green("✔"),
                bold(&steps.to_string())
            );
        } else {
            eprintln!(
                "{} {} steps stored  ({} asset files failed)",
                cyan("⚠"),
                bold(&steps.to_string()),
                red(&failures.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process a manual: extract, analyze, narrate, model
  threedocs process manual.pdf

  # Narration only, English voice
  threedocs process --no-3d --voice en_US-female-1 manual.pdf

  # Process from URL, JSON report
  threedocs --json process https://example.org/manuals/desk.pdf

  # Show stored steps (by file or by hash key)
  threedocs steps manual.pdf
  threedocs steps 3f2a9c0d41b7e815

  # Content hash of a file (no API key needed)
  threedocs hash manual.pdf

  # Every processed manual
  threedocs list

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (vision)
  OPENAI_API_KEY          OpenAI API key (vision)
  ANTHROPIC_API_KEY       Anthropic API key (vision)
  EDGEQUAKE_LLM_PROVIDER  Override vision provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override vision model ID
  TRIPO_API_KEY           Tripo 3D API key
  FISH_AUDIO_API_KEY      Fish Audio TTS API key
  THREEDOCS_VOLUME        Volume directory (default: volume)
  PDFIUM_LIB_PATH         Path to an existing libpdfium; skips auto-download
  THREEDOCS_PDFIUM_CACHE_DIR  Override the default pdfium cache directory

  Variables can also be placed in a .env file in the working directory.
"#;

/// Turn product manuals into narrated, step-by-step 3D guides.
#[derive(Parser, Debug)]
#[command(
    name = "threedocs",
    version,
    about = "Turn product manuals into narrated, step-by-step 3D guides",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory for uploaded PDFs and every generated file.
    #[arg(long, global = true, env = "THREEDOCS_VOLUME", default_value = "volume")]
    volume: PathBuf,

    /// SQLite database file. Default: <volume>/instructions.db.
    #[arg(long, global = true, env = "THREEDOCS_DATABASE")]
    database: Option<PathBuf>,

    /// Output structured JSON instead of text.
    #[arg(long, global = true, env = "THREEDOCS_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "THREEDOCS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "THREEDOCS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "THREEDOCS_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a manual (local file or HTTP/HTTPS URL).
    Process(ProcessArgs),
    /// Show the stored steps of a manual.
    Steps {
        /// PDF file, full hex digest, or hash key prefix.
        manual: String,
    },
    /// Print the content hash of a PDF.
    Hash {
        /// PDF file.
        file: PathBuf,
    },
    /// List every processed manual.
    List,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Narration voice ID.
    #[arg(long, env = "THREEDOCS_VOICE", default_value = threedocs::config::DEFAULT_VOICE_ID)]
    voice: String,

    /// Skip narration.
    #[arg(long, env = "THREEDOCS_NO_TTS")]
    no_tts: bool,

    /// Skip 3D model generation.
    #[arg(long = "no-3d", env = "THREEDOCS_NO_3D")]
    no_3d: bool,

    /// Vision model ID (e.g. gemini-2.5-flash, gpt-4.1).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Vision provider: gemini, openai, anthropic, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Concurrent requests per asset group.
    #[arg(short, long, env = "THREEDOCS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Images per vision request (0 = all in one request).
    #[arg(long, env = "THREEDOCS_IMAGES_PER_REQUEST", default_value_t = 0)]
    images_per_request: usize,

    /// Drop extracted images smaller than this many bytes.
    #[arg(long, env = "THREEDOCS_MIN_IMAGE_BYTES", default_value_t = 1024)]
    min_image_bytes: usize,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "THREEDOCS_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom vision system prompt.
    #[arg(long, env = "THREEDOCS_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max vision output tokens.
    #[arg(long, env = "THREEDOCS_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Vision temperature (0.0–2.0).
    #[arg(long, env = "THREEDOCS_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Retries per request on transient failure.
    #[arg(long, env = "THREEDOCS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "THREEDOCS_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-request timeout for hosted services in seconds.
    #[arg(long, env = "THREEDOCS_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// Give up on a 3D task after this many seconds.
    #[arg(long, env = "THREEDOCS_3D_TIMEOUT", default_value_t = 600)]
    model_timeout: u64,

    /// Do not download the PDF engine; rely on PDFIUM_LIB_PATH or the system library.
    #[arg(long, env = "THREEDOCS_SKIP_ENGINE_DOWNLOAD")]
    skip_engine_download: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let is_process = matches!(cli.command, Command::Process(_));
    let show_progress = is_process && !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| cli.volume.join("instructions.db"));

    match cli.command {
        Command::Process(ref args) => run_process(&cli, args, database, show_progress).await,
        Command::Steps { ref manual } => run_steps(&cli, manual, &database).await,
        Command::Hash { ref file } => run_hash(&cli, file).await,
        Command::List => run_list(&cli, &database).await,
    }
}

async fn run_process(
    cli: &Cli,
    args: &ProcessArgs,
    database: PathBuf,
    show_progress: bool,
) -> Result<()> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(cli, args, database, progress_cb).await?;
    let pipeline = Pipeline::new(config);

    // A stored manual never reaches extraction.
    if !args.skip_engine_download
        && !pipeline
            .is_processed(&args.input)
            .await
            .context("Failed to check the step database")?
    {
        ensure_engine(cli.quiet).await?;
    }

    let report = pipeline
        .process(&args.input)
        .await
        .context("Processing failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        print_report(&report, show_progress);
    }
    Ok(())
}

/// Download the pdfium library on first use, with a byte progress bar.
async fn ensure_engine(quiet: bool) -> Result<()> {
    if engine::cached_library_path().is_some() {
        return Ok(());
    }
    if quiet {
        engine::ensure_engine(None)
            .await
            .context("Failed to download PDF engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.set_message("Connecting…");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    let on_progress: &(dyn Fn(u64, Option<u64>) + Send + Sync) =
        &move |downloaded: u64, total: Option<u64>| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        };
    engine::ensure_engine(Some(on_progress))
        .await
        .context("Failed to download PDF engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

fn print_report(report: &ProcessReport, show_progress: bool) {
    let status = if report.failures.is_empty() {
        green("✔")
    } else {
        cyan("⚠")
    };
    if !show_progress {
        eprintln!(
            "{}  {}  {} steps{}",
            status,
            bold(&report.pdf_name),
            report.steps_processed,
            if report.cached { "  (cached)" } else { "" }
        );
        for f in &report.failures {
            eprintln!("  {} {}", red("✗"), f);
        }
    }
    let count = |n: Option<usize>| n.map_or_else(|| "off".to_string(), |n| n.to_string());
    eprintln!(
        "   key {}  ·  {} voice / {} model files generated  ·  {}ms total",
        dim(&report.pdf_hash),
        count(report.tts_files_generated),
        count(report.models_generated),
        report.duration_ms,
    );
}

async fn run_steps(cli: &Cli, manual: &str, database: &Path) -> Result<()> {
    let store = StepStore::open(database)
        .await
        .context("Failed to open step database")?;
    let hash = resolve_manual(&store, manual).await?;
    let steps = store.steps(&hash).await.context("Failed to read steps")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&steps).context("Failed to serialise steps")?
        );
        return Ok(());
    }

    if steps.is_empty() {
        println!("No steps stored for {}", hash.key());
        return Ok(());
    }
    for s in &steps {
        println!(
            "{:>3}. {}  [{}]",
            s.step,
            s.title.as_deref().unwrap_or("(untitled)"),
            s.confidence.as_str()
        );
        if let Some(ref d) = s.description {
            println!("     {}", d);
        }
        let file = |name: &Option<String>| name.clone().unwrap_or_else(|| "-".to_string());
        println!(
            "     {}",
            dim(&format!(
                "image {}  voice {}  model {}",
                file(&s.image_filename),
                file(&s.voice_filename),
                file(&s.model_filename)
            ))
        );
    }
    Ok(())
}

/// A PDF path, a full digest, or a unique key prefix of a processed manual.
async fn resolve_manual(store: &StepStore, manual: &str) -> Result<ContentHash> {
    let path = Path::new(manual);
    if path.is_file() {
        return ContentHash::of_file(path)
            .await
            .with_context(|| format!("Failed to hash {}", path.display()));
    }
    if let Some(hash) = ContentHash::from_hex(manual) {
        return Ok(hash);
    }

    let prefix = manual.trim().to_ascii_lowercase();
    if prefix.len() < 4 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("'{manual}' is neither a file nor a hash key");
    }
    let docs = store.documents().await.context("Failed to list manuals")?;
    let mut found = docs.iter().filter(|d| d.pdf_hash.starts_with(&prefix));
    match (found.next(), found.next()) {
        (Some(doc), None) => ContentHash::from_hex(&doc.pdf_hash)
            .with_context(|| format!("Corrupt hash in database: {}", doc.pdf_hash)),
        (None, _) => bail!("No processed manual matches '{manual}'"),
        (Some(_), Some(_)) => bail!("'{manual}' matches more than one manual"),
    }
}

async fn run_hash(cli: &Cli, file: &Path) -> Result<()> {
    let hash = ContentHash::of_file(file)
        .await
        .with_context(|| format!("Failed to hash {}", file.display()))?;
    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "sha256": hash.to_hex(), "key": hash.key() })
        );
    } else {
        println!("{}  {}", hash.to_hex(), file.display());
        println!("key {}", hash.key());
    }
    Ok(())
}

async fn run_list(cli: &Cli, database: &Path) -> Result<()> {
    let store = StepStore::open(database)
        .await
        .context("Failed to open step database")?;
    let docs = store.documents().await.context("Failed to list manuals")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&docs).context("Failed to serialise manuals")?
        );
        return Ok(());
    }
    if docs.is_empty() {
        println!("No manuals processed yet");
        return Ok(());
    }
    for d in &docs {
        println!(
            "{}  {:>3} steps  {:>3} images  {}  {}",
            &d.pdf_hash[..threedocs::hash::KEY_LEN.min(d.pdf_hash.len())],
            d.step_count,
            d.image_count,
            dim(&d.processed_at),
            d.pdf_name
        );
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(
    cli: &Cli,
    args: &ProcessArgs,
    database: PathBuf,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let system_prompt = if let Some(ref path) = args.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let tripo = TripoConfig {
        task_timeout_secs: args.model_timeout,
        ..TripoConfig::default()
    };

    let mut builder = PipelineConfig::builder()
        .volume_dir(&cli.volume)
        .database_path(database)
        .voice_id(&args.voice)
        .generate_tts(!args.no_tts)
        .generate_3d(!args.no_3d)
        .concurrency(args.concurrency)
        .images_per_request(args.images_per_request)
        .min_image_bytes(args.min_image_bytes)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .max_retries(args.max_retries)
        .download_timeout_secs(args.download_timeout)
        .api_timeout_secs(args.api_timeout)
        .tripo(tripo)
        .fish_audio(FishAudioConfig::default());

    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = args.password {
        builder = builder.password(password);
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
