pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "setter",
    about = "Setter operator CLI",
    long_about = "Check dialer readiness, apply migrations, inspect config, and audit call histories.",
    after_help = "Examples:\n  setter start\n  setter config\n  setter history 3f2c9e4a-..."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run startup preflight checks and return structured status output")]
    Start,
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Print and verify the transition history of one call attempt")]
    History {
        #[arg(help = "Call attempt id as shown in logs and the active-calls endpoint")]
        attempt_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start => commands::start::run(),
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::History { attempt_id } => commands::history::run(&attempt_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
