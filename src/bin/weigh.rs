//! weigh - Command-line front end for the weight tracker
//!
//! Commands:
//! - add / edit / delete: Manage recorded weights
//! - goal: Set the goal weight
//! - status: Show the derived metrics
//! - history: List recorded weights
//! - run: Apply NDJSON commands from stdin, printing a metrics snapshot per command
//! - doctor: Diagnose configuration and database health

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use weight_tracker::session::{format_percent, format_weight};
use weight_tracker::store::{DatabaseHealth, SqliteStore};
use weight_tracker::{
    ConfigError, MetricsSnapshot, SessionError, TrackerConfig, TrackerSession, WeightSample,
    VERSION,
};

/// weigh - Track body weight against a goal
#[derive(Parser)]
#[command(name = "weigh")]
#[command(version = VERSION)]
#[command(about = "Track body weight and progress toward a goal", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides the configuration)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Username to act as (defaults to the guest account)
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a weight
    Add {
        /// Weight value
        #[arg(short, long)]
        weight: String,

        /// Date recorded (defaults to today)
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Change a recorded weight
    Edit {
        /// Sample id (see `weigh history`)
        #[arg(long)]
        id: i64,

        #[arg(short, long)]
        weight: Option<String>,

        #[arg(short, long)]
        date: Option<String>,
    },

    /// Delete a recorded weight
    Delete {
        #[arg(long)]
        id: i64,
    },

    /// Set the goal weight
    Goal {
        #[arg(short, long)]
        weight: String,
    },

    /// Show progress toward the goal
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded weights, newest first
    History {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply NDJSON commands from stdin (streaming mode)
    Run {
        /// Flush output after every line
        #[arg(long, default_value = "true")]
        flush: bool,
    },

    /// Diagnose configuration and database health
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("WEIGH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("weight_tracker=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), WeighCliError> {
    let config = load_config(cli.config.as_deref(), cli.db)?;

    if let Commands::Doctor { json } = cli.command {
        return cmd_doctor(cli.config.as_deref(), &config, json);
    }

    let mut session = TrackerSession::open(config)?;
    match cli.user.as_deref() {
        Some(name) => session.log_in(name)?,
        None => session.log_in_guest()?,
    };

    match cli.command {
        Commands::Add { weight, date } => cmd_add(&session, &weight, date.as_deref()),
        Commands::Edit { id, weight, date } => {
            let sample = session.edit_sample(id.into(), weight.as_deref(), date.as_deref())?;
            println!("Updated {}", render_sample(&sample, &session.config().unit_label));
            Ok(())
        }
        Commands::Delete { id } => {
            session.delete_sample(id.into())?;
            println!("Deleted weight #{}", id);
            Ok(())
        }
        Commands::Goal { weight } => {
            session.set_goal(&weight)?;
            let goal = session.metrics().goal_weight;
            println!("Goal weight: {}", format_weight(goal, &session.config().unit_label));
            Ok(())
        }
        Commands::Status { json } => cmd_status(&session, json),
        Commands::History { json } => cmd_history(&session, json),
        Commands::Run { flush } => cmd_run(&mut session, flush),
        Commands::Doctor { .. } => Ok(()),
    }
}

fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> Result<TrackerConfig, WeighCliError> {
    let mut config = match path {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(db) = db {
        config.database_path = db;
    }
    Ok(config)
}

fn cmd_add(session: &TrackerSession, weight: &str, date: Option<&str>) -> Result<(), WeighCliError> {
    let unit = session.config().unit_label.clone();
    let _notice = session.engine().goal_reached().subscribe(move |reached| {
        if *reached {
            println!("Congratulations! You reached your goal weight.");
        }
    });

    let outcome = session.add_sample(weight, date)?;
    let current = session.metrics().current_weight;
    println!(
        "Recorded weight #{} (current: {})",
        outcome.id,
        format_weight(current, &unit)
    );
    Ok(())
}

fn cmd_status(session: &TrackerSession, json: bool) -> Result<(), WeighCliError> {
    let snapshot = session.metrics();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let unit = &session.config().unit_label;
    let username = session
        .active_user()
        .map(|u| u.username.as_str())
        .unwrap_or("-");
    let starting = match snapshot.starting_date {
        Some(date) => format!("{} ({})", format_weight(snapshot.starting_weight, unit), date),
        None => format_weight(snapshot.starting_weight, unit),
    };

    println!("Weight Status: {}", username);
    println!("==============");
    println!("Starting weight: {}", starting);
    println!("Current weight:  {}", format_weight(snapshot.current_weight, unit));
    println!("Goal weight:     {}", format_weight(snapshot.goal_weight, unit));
    println!("Progress:        {}", format_percent(snapshot.loss_percent));
    println!("Total loss:      {}", format_weight(Some(snapshot.total_loss), unit));
    println!("Target loss:     {}", format_weight(Some(snapshot.target_loss), unit));
    println!("Remaining:       {}", format_weight(Some(snapshot.remaining_loss), unit));
    Ok(())
}

fn cmd_history(session: &TrackerSession, json: bool) -> Result<(), WeighCliError> {
    let history = session.history()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No weights recorded");
    }
    for sample in &history {
        println!("{}", render_sample(sample, &session.config().unit_label));
    }
    Ok(())
}

fn render_sample(sample: &WeightSample, unit: &str) -> String {
    format!(
        "#{:<5} {}  {}",
        sample.id.0,
        sample.recorded_on,
        format_weight(Some(sample.value), unit)
    )
}

/// One line of `weigh run` input
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RunCommand {
    LogIn { username: String },
    Guest,
    LogOut,
    Add { weight: String, date: Option<String> },
    Edit { id: i64, weight: Option<String>, date: Option<String> },
    Delete { id: i64 },
    Goal { weight: String },
    Status,
}

/// One line of `weigh run` output
#[derive(Debug, Serialize)]
struct RunOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    goal_reached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    metrics: MetricsSnapshot,
}

fn cmd_run(session: &mut TrackerSession, flush: bool) -> Result<(), WeighCliError> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        let command: RunCommand = serde_json::from_str(trimmed).map_err(|e| {
            WeighCliError::ParseError(format!("Failed to parse command: {}", e))
        })?;

        // Rejected edits are reported inline so the stream keeps going
        let (goal_reached, error) = match apply_command(session, command) {
            Ok(reached) => (reached, None),
            Err(e) => (None, Some(e.to_string())),
        };

        let output = RunOutput {
            goal_reached,
            error,
            metrics: session.metrics(),
        };
        writeln!(stdout, "{}", serde_json::to_string(&output)?)?;
        if flush {
            stdout.flush()?;
        }
    }

    stdout.flush()?;
    Ok(())
}

fn apply_command(
    session: &mut TrackerSession,
    command: RunCommand,
) -> Result<Option<bool>, SessionError> {
    match command {
        RunCommand::LogIn { username } => {
            session.log_in(&username)?;
        }
        RunCommand::Guest => {
            session.log_in_guest()?;
        }
        RunCommand::LogOut => session.log_out(),
        RunCommand::Add { weight, date } => {
            let outcome = session.add_sample(&weight, date.as_deref())?;
            return Ok(Some(outcome.goal_reached));
        }
        RunCommand::Edit { id, weight, date } => {
            session.edit_sample(id.into(), weight.as_deref(), date.as_deref())?;
        }
        RunCommand::Delete { id } => session.delete_sample(id.into())?,
        RunCommand::Goal { weight } => {
            session.set_goal(&weight)?;
        }
        RunCommand::Status => {}
    }
    Ok(None)
}

fn cmd_doctor(
    config_path: Option<&Path>,
    config: &TrackerConfig,
    json: bool,
) -> Result<(), WeighCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("weight-tracker {}", VERSION),
    });

    checks.push(match config_path {
        Some(path) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: format!("Loaded {}", path.display()),
        },
        None => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: "Using defaults".to_string(),
        },
    });

    checks.push(database_check(&config.database_path));

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (run mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        version: VERSION.to_string(),
        unit_label: config.unit_label.clone(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("weigh doctor");
        println!("============");
        println!("Version: {}", report.version);
        println!("Units:   {}", report.unit_label);
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

    if report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error)) {
        Err(WeighCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

/// Inspect the database without creating it or switching its journal mode
fn database_check(db_path: &Path) -> DoctorCheck {
    match SqliteStore::inspect(db_path) {
        Ok(DatabaseHealth::Ready) => DoctorCheck {
            name: "database".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} opened, schema ready", db_path.display()),
        },
        Ok(DatabaseHealth::Missing) => DoctorCheck {
            name: "database".to_string(),
            status: CheckStatus::Warning,
            message: format!(
                "{} does not exist; it will be created on first use",
                db_path.display()
            ),
        },
        Ok(DatabaseHealth::MissingTables(tables)) => DoctorCheck {
            name: "database".to_string(),
            status: CheckStatus::Warning,
            message: format!(
                "{} is missing tables: {}",
                db_path.display(),
                tables.join(", ")
            ),
        },
        Err(e) => DoctorCheck {
            name: "database".to_string(),
            status: CheckStatus::Error,
            message: format!("Cannot open {}: {}", db_path.display(), e),
        },
    }
}

// Error types

#[derive(Debug)]
enum WeighCliError {
    Io(io::Error),
    Json(serde_json::Error),
    Config(ConfigError),
    Session(SessionError),
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for WeighCliError {
    fn from(e: io::Error) -> Self {
        WeighCliError::Io(e)
    }
}

impl From<serde_json::Error> for WeighCliError {
    fn from(e: serde_json::Error) -> Self {
        WeighCliError::Json(e)
    }
}

impl From<ConfigError> for WeighCliError {
    fn from(e: ConfigError) -> Self {
        WeighCliError::Config(e)
    }
}

impl From<SessionError> for WeighCliError {
    fn from(e: SessionError) -> Self {
        WeighCliError::Session(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<WeighCliError> for CliError {
    fn from(e: WeighCliError) -> Self {
        match e {
            WeighCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            WeighCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            WeighCliError::Config(e) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check the file passed to --config".to_string()),
            },
            WeighCliError::Session(SessionError::Input(e)) => CliError {
                code: "INVALID_INPUT".to_string(),
                message: e.to_string(),
                hint: Some("Weights are positive numbers, dates follow the configured format".to_string()),
            },
            WeighCliError::Session(e) => CliError {
                code: "STORE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'weigh doctor' for details".to_string()),
            },
            WeighCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            WeighCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Each line must be a JSON object with an \"op\" field".to_string()),
            },
        }
    }
}

// Report types

#[derive(Serialize)]
struct DoctorReport {
    version: String,
    unit_label: String,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
