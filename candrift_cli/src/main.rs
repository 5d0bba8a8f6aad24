use candrift_core::classifier::RuleClassifier;
use candrift_core::config::{CandriftConfig, ReportFormat, StrategyConfig, StrategyKind};
use candrift_core::corpus::SeedCorpus;
use candrift_core::frame::{Frame, IdWidth};
use candrift_core::generator::{IdRange, LengthBounds};
use candrift_core::recorder::{Finding, RecordOutcome};
use candrift_core::report::{FinalReport, LogSink, Progress, ProgressSink};
use candrift_core::session::{
    AbortReason, SessionControl, SessionController, SessionError, SessionOutcome, SessionPhase,
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_CONFIG_FILE: &str = "candrift.toml";
const EXIT_SUCCESS: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_BUS_FAULT: u8 = 2;

/// CAN bus fuzzer
#[derive(Parser, Debug)]
#[command(name = "candrift", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a TOML configuration file (default: ./candrift.toml if present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Frame generation strategy
    #[arg(long, value_enum, global = true)]
    strategy: Option<StrategyArg>,

    /// First arbitration ID to fuzz (hex)
    #[arg(long, value_parser = parse_id, global = true)]
    id_start: Option<u32>,

    /// Last arbitration ID to fuzz (hex, inclusive)
    #[arg(long, value_parser = parse_id, global = true)]
    id_end: Option<u32>,

    /// Use 29-bit extended arbitration IDs
    #[arg(long, global = true)]
    extended: bool,

    /// Minimum payload length in bytes
    #[arg(long, global = true)]
    min_len: Option<usize>,

    /// Maximum payload length in bytes (payload length for brute force)
    #[arg(long, global = true)]
    max_len: Option<usize>,

    /// Iteration budget
    #[arg(short, long)]
    iterations: Option<u64>,

    /// Running-time budget in seconds; without --iterations the session is
    /// bounded by time only
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Random seed, for reproducing a session
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Expected-response baseline (TOML, or JSON for .json files)
    #[arg(long, value_name = "FILE")]
    baseline: Option<PathBuf>,

    /// Seed corpus directive file or directory (can be repeated)
    #[arg(long, value_name = "PATH")]
    corpus: Vec<PathBuf>,

    /// Quiet window after each frame, in milliseconds
    #[arg(long)]
    quiet_window_ms: Option<u64>,

    /// Send retries before a transient failure becomes a bus fault
    #[arg(long)]
    retries: Option<u32>,

    /// Write the report to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors and the report
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write random cansend directives to a file, e.g. for replay
    Generate {
        /// Number of frames to generate
        #[arg(long, default_value_t = 100)]
        count: u64,

        /// Directive file to write
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StrategyArg {
    Random,
    Brute,
    Mutation,
    Replay,
}

impl From<StrategyArg> for StrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Random => StrategyKind::Random,
            StrategyArg::Brute => StrategyKind::Brute,
            StrategyArg::Mutation => StrategyKind::Mutation,
            StrategyArg::Replay => StrategyKind::Replay,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum FormatArg {
    Text,
    Json,
}

fn parse_id(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid arbitration ID '{s}': {e}"))
}

/// Prints progress on a single console line and findings as they appear.
struct ConsoleSink {
    quiet: bool,
}

impl ProgressSink for ConsoleSink {
    fn on_phase_change(&mut self, from: SessionPhase, to: SessionPhase) {
        log::debug!("Session {from} -> {to}");
    }

    fn on_finding(&mut self, finding: &Finding, outcome: &RecordOutcome) {
        if self.quiet || !outcome.is_new {
            return;
        }
        let frame = &finding.candidate().frame;
        println!(
            "\n!!! FINDING #{} (Iteration {}) !!!",
            outcome.index + 1,
            finding.discovered_at_iteration
        );
        println!("  Frame: {frame}");
        println!("  Reason: {}", finding.verdict);
        for response in &finding.observation.responses {
            println!("  Response: {response}");
        }
        println!("  Fingerprint: {}", finding.fingerprint());
    }

    fn on_progress(&mut self, progress: &Progress) {
        if self.quiet {
            return;
        }
        let budget = progress
            .max_iterations
            .map_or_else(|| "-".to_string(), |max| max.to_string());
        print!(
            "\rIter: {}/{}, Findings: {}, Iter/sec: {:.2}   ",
            progress.iterations,
            budget,
            progress.findings,
            progress.iterations_per_sec()
        );
        let _ = std::io::stdout().flush();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Some(Command::Generate { count, output }) => generate(&cli, *count, output).map(|()| None),
        None => fuzz(&cli).map(Some),
    };
    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
    }
    ExitCode::from(exit_status(&result))
}

/// Exit status for a finished command; `None` is a command without a session.
fn exit_status(result: &anyhow::Result<Option<SessionOutcome>>) -> u8 {
    match result {
        Ok(Some(SessionOutcome::Aborted(AbortReason::BusFault))) => EXIT_BUS_FAULT,
        Ok(_) => EXIT_SUCCESS,
        Err(_) => EXIT_ERROR,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CandriftConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            log::info!("Loading configuration from specified path: {path:?}");
            CandriftConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                log::info!("No config file specified, loading default: {default_path:?}");
                CandriftConfig::load_from_file(&default_path)?
            } else {
                log::info!(
                    "No config file specified and '{DEFAULT_CONFIG_FILE}' not found, using built-in defaults."
                );
                CandriftConfig::default()
            }
        }
    };

    if let Some(strategy) = cli.strategy {
        config.fuzzer.strategy = strategy.into();
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.seed = seed;
    }
    if cli.extended {
        config.generator.id_width = IdWidth::Extended;
    }
    if cli.id_start.is_some() || cli.id_end.is_some() {
        let current = config.generator.id_range;
        config.generator.id_range = IdRange::new(
            cli.id_start.unwrap_or(current.start),
            cli.id_end.unwrap_or(current.end),
        );
        config.generator.ids = None;
    }
    if cli.min_len.is_some() || cli.max_len.is_some() {
        let current = config.generator.payload_length;
        config.generator.payload_length = LengthBounds::new(
            cli.min_len.unwrap_or(current.min),
            cli.max_len.unwrap_or(current.max),
        );
    }
    match (cli.iterations, cli.duration_secs) {
        (Some(iterations), duration) => {
            config.fuzzer.max_iterations = Some(iterations);
            config.fuzzer.max_duration_secs = duration.or(config.fuzzer.max_duration_secs);
        }
        (None, Some(duration)) => {
            config.fuzzer.max_iterations = None;
            config.fuzzer.max_duration_secs = Some(duration);
        }
        (None, None) => {}
    }
    if let Some(path) = &cli.baseline {
        config.classifier.baseline_path = Some(path.clone());
    }
    if !cli.corpus.is_empty() {
        config.corpus.seed_paths = cli.corpus.clone();
    }
    if let Some(window) = cli.quiet_window_ms {
        config.observer.quiet_window_ms = window;
    }
    if let Some(retries) = cli.retries {
        config.transport.retry_limit = retries;
    }
    if let Some(output) = &cli.output {
        config.report.output = Some(output.clone());
    }
    if let Some(format) = cli.format {
        config.report.format = match format {
            FormatArg::Text => ReportFormat::Text,
            FormatArg::Json => ReportFormat::Json,
        };
    }

    log::debug!("Effective configuration: {config:#?}");
    Ok(config)
}

fn fuzz(cli: &Cli) -> anyhow::Result<SessionOutcome> {
    let config = load_config(cli)?;

    let control = SessionControl::default();
    let handler_control = control.clone();
    ctrlc::set_handler(move || handler_control.request_cancel())
        .context("Failed to install Ctrl-C handler")?;

    run_session(&config, cli.quiet, control)
}

/// Runs one session on the virtual bus and emits its report.
fn run_session(
    config: &CandriftConfig,
    quiet: bool,
    control: SessionControl,
) -> anyhow::Result<SessionOutcome> {
    config.validate().context("Invalid configuration")?;

    let seed_corpus = if config.fuzzer.strategy.uses_seed_corpus() {
        let corpus = SeedCorpus::load_from_paths(&config.corpus.seed_paths)
            .context("Failed to load seed corpus")?;
        log::info!("Loaded {} seed frames", corpus.len());
        corpus
    } else {
        SeedCorpus::new()
    };
    let classifier =
        RuleClassifier::from_settings(&config.classifier).context("Failed to load baseline")?;

    if config.virtual_bus.ecu.is_empty() {
        log::warn!("Virtual bus has no simulated ECUs; every frame will go unanswered");
    }
    let bus = config.virtual_bus.build_bus();

    let mut session = SessionController::with_control(bus, control);
    session.configure_strategy(config.strategy(seed_corpus))?;
    session.configure_classifier(Box::new(classifier))?;
    session.set_stop_condition(config.stop_condition())?;
    session.configure_bus(&config.observer, &config.transport)?;
    // JSON on stdout must stay parseable, so progress goes to the log instead.
    let sink: Box<dyn ProgressSink> =
        if config.report.format == ReportFormat::Json && config.report.output.is_none() {
            Box::new(LogSink)
        } else {
            Box::new(ConsoleSink { quiet })
        };
    session.set_sink(sink, config.fuzzer.progress_interval);

    session.start()?;
    let fault = loop {
        match session.run() {
            Ok(SessionPhase::Paused) => session.resume()?,
            Ok(_) => break None,
            Err(SessionError::BusFault(fault)) => break Some(fault),
            Err(e) => return Err(e.into()),
        }
    };
    if !quiet {
        println!();
    }

    let report = session
        .report()
        .context("Session ended without producing a report")?;
    emit_report(&report, config.report.format, config.report.output.as_deref())?;

    if let Some(fault) = fault {
        eprintln!("FATAL BUS FAULT: {fault}");
    } else if report.outcome == SessionOutcome::Aborted(AbortReason::Cancelled) {
        log::info!("Session cancelled by user");
    }
    Ok(report.outcome)
}

fn emit_report(
    report: &FinalReport,
    format: ReportFormat,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let rendered = match format {
        ReportFormat::Text => report.render_text(),
        ReportFormat::Json => report.to_json().context("Failed to serialize report")?,
    };
    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write report to {path:?}"))?;
            log::info!("Report written to {path:?}");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn generate(cli: &Cli, count: u64, output: &Path) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let mut generator = StrategyConfig::new(StrategyKind::Random, config.generator.clone())
        .with_seed(config.fuzzer.seed)
        .build()
        .context("Invalid generator configuration")?;

    let mut frames: Vec<Frame> = Vec::new();
    while (frames.len() as u64) < count {
        match generator.next_candidate()? {
            Some(candidate) => frames.push(candidate.frame),
            None => break,
        }
    }
    let written = SeedCorpus::write_directives(output, &frames)?;
    println!("Wrote {written} directives to {output:?}");
    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
