use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::utils::init_logging;
use playtime::billing::BillingRates;
use playtime::sessions::Actor;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let actor = Actor {
        id: args.actor.clone(),
        role: args.role,
    };

    match args.command {
        Commands::Serve => commands::run_serve(args.config.as_deref(), args.verbose),
        Commands::Config { command } => commands::run_config_command(command),
        Commands::Time => {
            init_logging(args.verbose, "warn");
            commands::run_time(&args.server)
        }
        Commands::Sessions { command } => {
            init_logging(args.verbose, "warn");
            commands::run_sessions_command(command, &args.server, &actor)
        }
        Commands::Settings { command } => {
            init_logging(args.verbose, "warn");
            commands::run_settings_command(command, &args.server, &actor)
        }
        Commands::Watch => {
            init_logging(args.verbose, "warn");
            commands::run_watch(&args.server, &actor)
        }
        Commands::Report {
            anchor,
            days,
            fee_per_block,
            block_minutes,
        } => {
            init_logging(args.verbose, "warn");
            let defaults = BillingRates::default();
            let rates = BillingRates {
                fee_per_block: fee_per_block.unwrap_or(defaults.fee_per_block),
                block_minutes: block_minutes.unwrap_or(defaults.block_minutes),
            };
            commands::run_report(
                commands::ReportOptions {
                    anchor,
                    days,
                    rates,
                },
                &args.server,
                &actor,
            )
        }
    }
}
