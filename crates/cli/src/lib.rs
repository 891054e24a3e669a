pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use leaveflow_core::config::{AppConfig, LoadOptions};
use leaveflow_core::domain::org::Actor;
use leaveflow_core::domain::step::Decision;

#[derive(Debug, Parser)]
#[command(
    name = "leaveflow",
    about = "Leaveflow operator CLI",
    long_about = "Operate the leave approval engine: migrations, config inspection, policy import, and request lifecycle.",
    after_help = "Examples:\n  leaveflow doctor --json\n  leaveflow seed\n  leaveflow request submit config/requests/vacation.toml\n  leaveflow request act LR-2026-0001 <step-id> --actor u-tess --decision approve"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a leaveflow.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo organization and policy set")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, escalation contacts, DB connectivity and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Validate or import approval policy bundles")]
    Policy(PolicyCommand),
    #[command(subcommand, about = "Submit, inspect, decide and cancel leave requests")]
    Request(RequestCommand),
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    #[command(about = "Parse and validate a TOML or JSON policy bundle without storing it")]
    Check { file: PathBuf },
    #[command(about = "Validate a policy bundle and store every policy and watcher rule in it")]
    Import { file: PathBuf },
}

#[derive(Debug, Subcommand)]
enum RequestCommand {
    #[command(about = "Submit a leave request described by a TOML or JSON file")]
    Submit { file: PathBuf },
    #[command(about = "Show a leave request and all of its approval steps")]
    Steps { id: String },
    #[command(about = "List the steps an approver can decide right now")]
    Pending {
        #[arg(long, help = "Approver whose open steps to list")]
        approver: String,
    },
    #[command(about = "Approve or reject one approval step")]
    Act {
        id: String,
        step: String,
        #[arg(long, help = "User acting on the step")]
        actor: String,
        #[arg(long, value_enum)]
        decision: DecisionArg,
        #[arg(long, help = "Act as an administrator (required for escalated steps)")]
        admin: bool,
    },
    #[command(about = "Cancel a leave request, voiding every outstanding step")]
    Cancel {
        id: String,
        #[arg(long, help = "User canceling the request")]
        actor: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DecisionArg {
    Approve,
    Reject,
}

impl From<DecisionArg> for Decision {
    fn from(value: DecisionArg) -> Self {
        match value {
            DecisionArg::Approve => Decision::Approve,
            DecisionArg::Reject => Decision::Reject,
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions {
        require_file: cli.config.is_some(),
        config_path: cli.config,
        ..LoadOptions::default()
    };
    if let Err(error) = logging::init(AppConfig::load(options.clone()).ok().as_ref()) {
        eprintln!("warning: {error:#}");
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Seed => commands::seed::run(&options),
        Command::Config => commands::config::run(&options),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(&options, json) }
        }
        Command::Policy(PolicyCommand::Check { file }) => commands::policy::check(&file),
        Command::Policy(PolicyCommand::Import { file }) => {
            commands::policy::import(&options, &file)
        }
        Command::Request(RequestCommand::Submit { file }) => {
            commands::request::submit(&options, &file)
        }
        Command::Request(RequestCommand::Steps { id }) => commands::request::steps(&options, &id),
        Command::Request(RequestCommand::Pending { approver }) => {
            commands::request::pending(&options, &approver)
        }
        Command::Request(RequestCommand::Act { id, step, actor, decision, admin }) => {
            let actor = if admin { Actor::administrator(actor) } else { Actor::user(actor) };
            commands::request::act(&options, &id, &step, actor, decision.into())
        }
        Command::Request(RequestCommand::Cancel { id, actor }) => {
            commands::request::cancel(&options, &id, Actor::user(actor))
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
