//! Rods CLI - runs haptic rod comparison sessions
//!
//! Commands:
//! - run: administer the battery to the next participant (stdin is the response surface)
//! - align: regenerate the aligned datasets of an existing participant
//! - doctor: check configuration, problem files and data directories

use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use haptic_rods_session::align::{AlignmentReport, CommandFetcher, SessionLogAligner};
use haptic_rods_session::answer::AnswerOutcome;
use haptic_rods_session::device::CommandCompanion;
use haptic_rods_session::layout::SessionLayout;
use haptic_rods_session::{
    ProblemSet, RunCounter, SensorLogHandle, SensorSupervisor, SessionConfig, SessionController,
    SessionError, SessionPhase, SessionSettings, TcpDeviceLink, CONTROLLER_VERSION,
    PRODUCER_NAME,
};

/// Rods - haptic rod comparison session controller
#[derive(Parser)]
#[command(name = "rods")]
#[command(version = CONTROLLER_VERSION)]
#[command(about = "Run haptic rod comparison sessions", long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = "rods.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administer the battery to one participant
    Run {
        /// Run counter file holding latest_user_id
        #[arg(long, default_value = "meta.toml")]
        meta: PathBuf,

        /// Use this participant id instead of incrementing the run counter
        #[arg(long)]
        participant: Option<u64>,

        /// Print the alignment report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Regenerate aligned datasets for an existing participant
    Align {
        /// Participant id
        #[arg(long)]
        participant: u64,

        /// Last administered problem (defaults to the end of the battery)
        #[arg(long)]
        last: Option<usize>,

        /// Use the interaction artifacts already on disk
        #[arg(long)]
        no_transfer: bool,

        /// Print the alignment report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and storage
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    // stdout belongs to the participant; logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<(), RodsCliError> {
    let config = SessionConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            meta,
            participant,
            json,
        } => cmd_run(&config, &meta, participant, json),

        Commands::Align {
            participant,
            last,
            no_transfer,
            json,
        } => cmd_align(&config, participant, last, no_transfer, json),

        Commands::Doctor { json } => cmd_doctor(&cli.config, &config, json),
    }
}

fn cmd_run(
    config: &SessionConfig,
    meta: &Path,
    participant: Option<u64>,
    json: bool,
) -> Result<(), RodsCliError> {
    let participant = match participant {
        Some(id) => id,
        None => RunCounter::new(meta).next()?,
    };

    let mut companion = CommandCompanion::new(config.device.companion_command.clone());
    let device = TcpDeviceLink::connect(
        &config.device.endpoint,
        &mut companion,
        config.device.settle_delay(),
    )?;
    let sensor = SensorSupervisor::new(config.sensor.command.clone(), config.sensor.log_dir.clone());
    let fetcher = CommandFetcher::new(config.device.transfer_command.clone());

    let mut session = SessionController::new(
        SessionSettings::from_config(participant, config),
        device,
        sensor,
        fetcher,
    );

    match administer(&mut session) {
        Ok(report) => {
            if let Some(report) = report {
                print_report(&report, json)?;
            }
            Ok(())
        }
        Err(e) => {
            session.abort();
            Err(e)
        }
    }
}

/// Prompt on stdout, read answers from stdin until the battery ends or stdin closes
fn administer(
    session: &mut SessionController<TcpDeviceLink, SensorSupervisor, CommandFetcher>,
) -> Result<Option<AlignmentReport>, RodsCliError> {
    session.start()?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut lines = stdin.lock().lines();

    while let SessionPhase::Active(_) = session.phase() {
        if let Some(problem) = session.current_problem() {
            writeln!(stdout, "\n[{}]", problem.progress_label(session.battery_size()))?;
            writeln!(stdout, "{}", problem.statement())?;
        }
        write!(stdout, "Your answer: ")?;
        stdout.flush()?;

        let Some(line) = lines.next() else {
            writeln!(stdout)?;
            break;
        };
        let line = line?;

        match session.submit_answer(&line)? {
            AnswerOutcome::Correct => writeln!(stdout, "Correct!")?,
            AnswerOutcome::Incorrect => writeln!(stdout, "Not quite.")?,
            AnswerOutcome::Rejected { .. } => {
                writeln!(stdout, "Please enter a number such as 3, 1.5 or 3/2.")?
            }
        }
    }

    // Idempotent: already done when the last answer ended the battery.
    session.end_session()?;
    Ok(session.alignment_report().cloned())
}

fn cmd_align(
    config: &SessionConfig,
    participant: u64,
    last: Option<usize>,
    no_transfer: bool,
    json: bool,
) -> Result<(), RodsCliError> {
    let layout = SessionLayout::new(config.storage.data_root.clone(), participant);
    if !layout.participant_dir().is_dir() {
        return Err(RodsCliError::UnknownParticipant(participant));
    }

    let last = last.unwrap_or(config.battery_size - 1);
    let transfer = if no_transfer {
        Default::default()
    } else {
        config.device.transfer_command.clone()
    };
    let mut fetcher = CommandFetcher::new(transfer);
    let sensor_log = SensorLogHandle::existing(config.sensor.log_dir.clone());

    let aligner = SessionLogAligner::new(layout, config.sensor.timestamp_column.clone(), Uuid::new_v4());
    let report = aligner.align(&mut fetcher, &sensor_log, last)?;
    print_report(&report, json)
}

fn print_report(report: &AlignmentReport, json: bool) -> Result<(), RodsCliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Alignment Report");
    println!("================");
    println!("Participant:    {}", report.participant);
    println!("Sensor log:     {}", report.sensor_log.display());
    println!("Sensor samples: {}", report.sensor_samples);
    println!("\nDatasets:");
    for dataset in &report.datasets {
        println!(
            "  - problem {} [{}, {}]: {} samples -> {}",
            dataset.index,
            dataset.interval.start,
            dataset.interval.end,
            dataset.samples,
            dataset.path.display()
        );
    }
    if !report.skipped.is_empty() {
        println!("\nSkipped:");
        for skipped in &report.skipped {
            println!("  - problem {}: {}", skipped.index, skipped.reason);
        }
    }
    Ok(())
}

fn cmd_doctor(config_path: &Path, config: &SessionConfig, json: bool) -> Result<(), RodsCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "config".to_string(),
        status: CheckStatus::Ok,
        message: if config_path.exists() {
            format!("Loaded {}", config_path.display())
        } else {
            format!("{} not found, using defaults", config_path.display())
        },
    });

    let problems = ProblemSet::new(config.storage.problem_dir.clone());
    let broken = problems.check(config.battery_size);
    checks.push(if broken.is_empty() {
        DoctorCheck {
            name: "problems".to_string(),
            status: CheckStatus::Ok,
            message: format!(
                "{} problems valid in {}",
                config.battery_size,
                problems.dir().display()
            ),
        }
    } else {
        DoctorCheck {
            name: "problems".to_string(),
            status: CheckStatus::Error,
            message: broken
                .iter()
                .map(|(index, reason)| format!("problem {}: {}", index, reason))
                .collect::<Vec<_>>()
                .join("; "),
        }
    });

    checks.push(directory_check(
        "data_root",
        &config.storage.data_root,
        CheckStatus::Warning,
        "will be created at session start",
    ));
    checks.push(directory_check(
        "sensor_logs",
        &config.sensor.log_dir,
        CheckStatus::Error,
        "the sensor writes its logs here",
    ));

    checks.push(DoctorCheck {
        name: "stdin".to_string(),
        status: if atty::is(atty::Stream::Stdin) {
            CheckStatus::Ok
        } else {
            CheckStatus::Warning
        },
        message: if atty::is(atty::Stream::Stdin) {
            "stdin is a TTY (participant input ready)".to_string()
        } else {
            "stdin is not a TTY; answers will be read from a pipe".to_string()
        },
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: CONTROLLER_VERSION.to_string(),
        endpoint: config.device.endpoint.clone(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Rods Doctor Report");
        println!("==================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("Device:   {}", report.endpoint);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(RodsCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn directory_check(name: &str, dir: &Path, missing: CheckStatus, hint: &str) -> DoctorCheck {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: format!("{} exists", dir.display()),
        },
        Ok(_) => DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: format!("{} is not a directory", dir.display()),
        },
        Err(_) => DoctorCheck {
            name: name.to_string(),
            status: missing,
            message: format!("{} does not exist ({})", dir.display(), hint),
        },
    }
}

// Error types

#[derive(Debug)]
enum RodsCliError {
    Io(io::Error),
    Session(SessionError),
    Json(serde_json::Error),
    UnknownParticipant(u64),
    DoctorFailed,
}

impl From<io::Error> for RodsCliError {
    fn from(e: io::Error) -> Self {
        RodsCliError::Io(e)
    }
}

impl From<SessionError> for RodsCliError {
    fn from(e: SessionError) -> Self {
        RodsCliError::Session(e)
    }
}

impl From<serde_json::Error> for RodsCliError {
    fn from(e: serde_json::Error) -> Self {
        RodsCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<RodsCliError> for CliError {
    fn from(e: RodsCliError) -> Self {
        match e {
            RodsCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            RodsCliError::Session(e) => {
                let (code, hint) = session_error_hint(&e);
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
            RodsCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            RodsCliError::UnknownParticipant(id) => CliError {
                code: "UNKNOWN_PARTICIPANT".to_string(),
                message: format!("No data directory for participant {}", id),
                hint: Some("Check storage.data_root and the participant id".to_string()),
            },
            RodsCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

fn session_error_hint(e: &SessionError) -> (&'static str, Option<&'static str>) {
    match e {
        SessionError::Connection { .. } => (
            "CONNECTION_ERROR",
            Some("Check that the device is powered and device.endpoint is right"),
        ),
        SessionError::Protocol(_) | SessionError::DeviceClosed(_) => (
            "PROTOCOL_ERROR",
            Some("The device dropped the session; start a new run"),
        ),
        SessionError::DuplicateParticipant(_) => (
            "DUPLICATE_PARTICIPANT",
            Some("Check meta.toml; participant ids must not be reused"),
        ),
        SessionError::ProblemLoad { .. } => (
            "PROBLEM_ERROR",
            Some("Run 'rods doctor' to validate the problem set"),
        ),
        SessionError::SensorProcess(_) | SessionError::SensorLog(_) => {
            ("SENSOR_ERROR", Some("Check sensor.command and sensor.log_dir"))
        }
        SessionError::Transfer(_) => (
            "TRANSFER_ERROR",
            Some("Retry with 'rods align' once the device is reachable"),
        ),
        SessionError::Config(_) => ("CONFIG_ERROR", Some("Check the configuration file")),
        SessionError::InvalidTransition(_) => ("INVALID_TRANSITION", None),
        SessionError::Io(_) => ("IO_ERROR", Some("Check file paths and permissions")),
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    endpoint: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
