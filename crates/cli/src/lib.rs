pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "datapilot",
    about = "Datapilot operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, vet SQL against the read-only gate, list discovered tools and recent threads, and run single agent turns.",
    after_help = "Examples:\n  datapilot doctor --json\n  datapilot check-sql \"SELECT * FROM orders\" --dialect postgres\n  datapilot ask --thread cli:1 \"How many orders shipped today?\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending checkpoint database migrations")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, LLM settings, database and tool backend connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(name = "check-sql", about = "Run a query through the read-only SQL gate offline")]
    CheckSql {
        #[arg(help = "SQL text to validate")]
        query: String,
        #[arg(long, help = "SQL dialect; defaults to agent.sql_dialect from config")]
        dialect: Option<String>,
    },
    #[command(about = "Connect to the configured tool backends and list their tools")]
    Tools,
    #[command(about = "List the most recently updated conversation threads")]
    Threads {
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=500))]
        limit: u32,
    },
    #[command(about = "Run one conversation turn; progress is written to stderr")]
    Ask {
        #[arg(long, help = "Conversation thread id")]
        thread: String,
        #[arg(help = "User message")]
        text: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::CheckSql { query, dialect } => commands::check_sql::run(&query, dialect.as_deref()),
        Command::Tools => commands::tools::run(),
        Command::Threads { limit } => commands::threads::run(limit),
        Command::Ask { thread, text } => commands::ask::run(&thread, &text),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Diagnostics go to stderr so command output on stdout stays machine-readable.
fn init_logging() {
    let filter = EnvFilter::try_from_env("DATAPILOT_CLI_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
