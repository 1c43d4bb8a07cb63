use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use playtime::billing::ReportAnchor;
use playtime::client::DEFAULT_SERVER_URL;
use playtime::sessions::{Role, SessionStatus};

/// Play-area session timer
///
/// Runs the session server, or talks to a running one to start, pause,
/// resume and close timed child sessions.
#[derive(Parser, Debug)]
#[command(name = "playtime")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the server configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Server base URL (client commands)
    #[arg(long, default_value = DEFAULT_SERVER_URL, global = true)]
    pub server: String,

    /// Actor id sent to the server (client commands)
    #[arg(long, default_value = "cli", global = true)]
    pub actor: String,

    /// Actor role sent to the server (client commands)
    #[arg(long, default_value = "admin", global = true)]
    pub role: Role,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the session server (API, event stream and expiry sweeper)
    Serve,
    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Measure the offset between this machine's clock and the server's
    Time,
    /// Manage sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Read or change the default session length
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Live countdown of every session
    Watch,
    /// Daily billing totals
    Report {
        /// Which timestamp assigns a session to a day
        #[arg(long, default_value = "completion")]
        anchor: ReportAnchor,

        /// Only show the most recent N days
        #[arg(long)]
        days: Option<usize>,

        /// Fee charged per started block (defaults to the built-in rate)
        #[arg(long)]
        fee_per_block: Option<u64>,

        /// Block length in minutes (defaults to the built-in rate)
        #[arg(long)]
        block_minutes: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Write the example configuration
    Init {
        /// Destination (defaults to the platform config location)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List sessions
    List {
        /// Only sessions in this status (e.g. running, paused)
        #[arg(long)]
        status: Option<SessionStatus>,
    },
    /// Start a session
    Create {
        /// Child's name
        #[arg(long)]
        name: String,

        /// Length in minutes (defaults to the server setting)
        #[arg(long)]
        minutes: Option<i64>,

        #[arg(long)]
        notes: Option<String>,
    },
    /// Change name, notes or length
    Update {
        id: Uuid,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        minutes: Option<i64>,

        #[arg(long)]
        notes: Option<String>,
    },
    /// Freeze the countdown
    Pause { id: Uuid },
    /// Restart a paused countdown
    Resume { id: Uuid },
    /// Record that the child has left
    Confirm { id: Uuid },
    /// Abandon a session
    Cancel { id: Uuid },
    /// Remove a session record
    Delete { id: Uuid },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Show current settings
    Get,
    /// Set the default session length
    Set {
        /// Minutes used when a session is created without a length
        #[arg(long)]
        default_minutes: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_session_create() {
        let args = Args::parse_from([
            "playtime", "sessions", "create", "--name", "Ana", "--minutes", "20",
        ]);
        match args.command {
            Commands::Sessions {
                command: SessionCommands::Create { name, minutes, .. },
            } => {
                assert_eq!(name, "Ana");
                assert_eq!(minutes, Some(20));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(args.server, DEFAULT_SERVER_URL);
        assert_eq!(args.role, Role::Admin);
    }

    #[test]
    fn test_parse_report_anchor_and_role() {
        let args = Args::parse_from([
            "playtime", "--role", "employee", "report", "--anchor", "creation",
        ]);
        assert_eq!(args.role, Role::Employee);
        assert!(matches!(
            args.command,
            Commands::Report {
                anchor: ReportAnchor::Creation,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_status_filter() {
        let args = Args::parse_from(["playtime", "sessions", "list", "--status", "expired-waiting-confirm"]);
        assert!(matches!(
            args.command,
            Commands::Sessions {
                command: SessionCommands::List {
                    status: Some(SessionStatus::ExpiredWaitingConfirm)
                }
            }
        ));
    }
}
