pub mod config;
pub mod report;
pub mod serve;
pub mod sessions;
pub mod time;
pub mod utils;
pub mod watch;

pub use config::run_config_command;
pub use report::{run_report, ReportOptions};
pub use serve::run_serve;
pub use sessions::{run_sessions_command, run_settings_command};
pub use time::run_time;
pub use watch::run_watch;
