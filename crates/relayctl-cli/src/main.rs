#![deny(unsafe_code)]

//! relayctl CLI: configuration checks and offline exit-policy evaluation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use relayctl_config::{AppConfig, ExitPolicy};
use relayctl_core::build_info;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// relayctl: control-port session tooling for relay daemons.
#[derive(Parser)]
#[command(name = "relayctl", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "relayctl.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Evaluate exit policies without a daemon.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },

    /// Show build information.
    Version,
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Whether the policy lets traffic exit to ADDR:PORT.
    Check {
        /// Destination as `address:port`.
        target: String,

        /// Policy rule, in evaluation order (repeatable, comma lists allowed).
        #[arg(short, long = "rule", required = true)]
        rules: Vec<String>,
    },

    /// Print the policy with aliases expanded.
    Expand {
        #[arg(short, long = "rule", required = true)]
        rules: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
    debug!(version = %build_info::version_string(), "relayctl starting");

    match cli.command {
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
        Commands::Policy { command } => match command {
            PolicyCommand::Check { target, rules } => {
                let allowed = cmd_policy_check(&target, &rules)?;
                println!("{}", if allowed { "accept" } else { "reject" });
            }
            PolicyCommand::Expand { rules } => {
                for rule in build_policy(&rules)?.rules() {
                    println!("{}", rule.rule_text());
                }
            }
        },
        Commands::Version => println!("relayctl {}", build_info::version_string()),
    }

    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render configuration")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Split `--rule` values into individual rules.
fn policy_entries(rules: &[String]) -> Vec<String> {
    rules
        .iter()
        .flat_map(|rule| rule.split(','))
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_policy(rules: &[String]) -> Result<std::sync::Arc<ExitPolicy>> {
    match ExitPolicy::from_entries(&policy_entries(rules))? {
        Some(policy) => Ok(policy),
        None => bail!("no policy rules given"),
    }
}

fn cmd_policy_check(target: &str, rules: &[String]) -> Result<bool> {
    let (address, port) = target
        .rsplit_once(':')
        .with_context(|| format!("expected ADDR:PORT, got {target:?}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {target:?}"))?;

    let policy = build_policy(rules)?;
    Ok(policy.check(address, port))
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path).await?)
    } else {
        info!(path = %path.display(), "config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn rules(list: &[&str]) -> Vec<String> {
        list.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_policy_entries_split_commas() {
        assert_eq!(
            policy_entries(&rules(&["reject *:25, reject *:119", "accept *:*"])),
            vec!["reject *:25", "reject *:119", "accept *:*"]
        );
    }

    #[test]
    fn test_policy_check() {
        let policy = rules(&["reject private:*", "accept *:80", "reject *:*"]);
        assert!(cmd_policy_check("8.8.8.8:80", &policy).unwrap());
        assert!(!cmd_policy_check("8.8.8.8:443", &policy).unwrap());
        assert!(!cmd_policy_check("192.168.1.1:80", &policy).unwrap());
    }

    #[test]
    fn test_policy_check_bad_target() {
        let policy = rules(&["accept *:*"]);
        assert!(cmd_policy_check("8.8.8.8", &policy).is_err());
        assert!(cmd_policy_check("8.8.8.8:http", &policy).is_err());
        assert!(cmd_policy_check("8.8.8.8:80", &[]).is_err());
    }

    #[test]
    fn test_expand_private() {
        let policy = build_policy(&rules(&["reject private:*", "accept *:*"])).unwrap();
        assert_eq!(policy.rules().count(), 7);
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relayctl.toml");
        std::fs::write(&path, "[control]\nport = 9151\n").unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.control.port, 9151);

        let missing = load_config(&dir.path().join("missing.toml")).await.unwrap();
        assert_eq!(missing.control.port, 9051);
    }

    #[test]
    fn test_cli_parses_policy_check() {
        let cli = Cli::parse_from([
            "relayctl",
            "policy",
            "check",
            "10.0.0.1:22",
            "--rule",
            "reject private:*",
            "-r",
            "accept *:*",
        ]);
        let Commands::Policy {
            command: PolicyCommand::Check { target, rules },
        } = cli.command
        else {
            panic!("expected policy check");
        };
        assert_eq!(target, "10.0.0.1:22");
        assert_eq!(rules.len(), 2);
    }
}
