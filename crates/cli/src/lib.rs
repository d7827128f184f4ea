pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "dealdesk",
    about = "Dealdesk operator CLI",
    long_about = "Operate the discount approval desk: migrations, config inspection, readiness checks, and request lookups.",
    after_help = "Examples:\n  dealdesk doctor --json\n  dealdesk status DAR-1f3c...\n  dealdesk deal set-base D-100 100000"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, signing key, DB connectivity and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Show the current state of a discount request")]
    Status {
        #[arg(help = "Discount request id")]
        request_id: String,
    },
    #[command(about = "Print the audit trail of a discount request or deal")]
    Audit {
        #[arg(help = "Discount request id or deal id")]
        entity_id: String,
    },
    #[command(subcommand, about = "Deal pricing maintenance")]
    Deal(DealCommand),
}

#[derive(Debug, Subcommand)]
enum DealCommand {
    #[command(about = "Set a deal's undiscounted base total")]
    SetBase {
        deal_id: String,
        amount: String,
        #[arg(long, default_value = "cli", help = "Actor recorded in the audit trail")]
        actor: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Status { request_id } => commands::status::run(&request_id),
        Command::Audit { entity_id } => commands::audit::run(&entity_id),
        Command::Deal(DealCommand::SetBase { deal_id, amount, actor }) => {
            commands::deal::set_base(&deal_id, &amount, &actor)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
