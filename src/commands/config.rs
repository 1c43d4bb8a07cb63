use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use playtime::config::{default_config_path, ServerConfig, EXAMPLE_CONFIG};

use crate::cli::ConfigCommands;

pub fn run_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Init { output, force } => {
            let path = match output {
                Some(path) => path,
                None => default_config_path()
                    .context("Could not determine a config directory; pass --output")?,
            };
            init_config(&path, force)?;
            println!("✓ Example configuration written to: {}", path.display());
            println!();
            println!("Start the server with:");
            println!("  playtime --config {} serve", path.display());
            Ok(())
        }
    }
}

/// Write the example config to `path`, refusing to clobber unless `force`
pub fn init_config(path: &Path, force: bool) -> Result<PathBuf> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    // Never write something the server would refuse to load
    ServerConfig::parse(EXAMPLE_CONFIG).context("Built-in example config is invalid")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    #[test]
    fn test_init_writes_example() {
        let temp = assert_fs::TempDir::new().unwrap();
        let target = temp.child("nested/playtime.toml");

        init_config(target.path(), false).unwrap();

        target.assert(predicate::path::exists());
        target.assert(predicate::str::contains("interval_secs = 5"));
        assert!(ServerConfig::load(target.path()).is_ok());
    }

    #[test]
    fn test_init_refuses_to_overwrite_without_force() {
        let temp = assert_fs::TempDir::new().unwrap();
        let target = temp.child("playtime.toml");
        target.write_str("# mine").unwrap();

        assert!(init_config(target.path(), false).is_err());
        target.assert("# mine");

        init_config(target.path(), true).unwrap();
        target.assert(predicate::str::contains("[server]"));
    }
}
