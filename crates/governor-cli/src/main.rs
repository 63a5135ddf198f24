#![deny(unsafe_code)]

//! Governor CLI — validate configuration, render the system prompt and run
//! scripted sessions offline.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use governor_config::AppConfig;
use governor_core::engine::{ReplayEngine, ReplayScript};
use governor_core::{ChatTemplate, ExecuteHooks, Governor, GovernorEvent, GovernorStatus, ToolRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Governor — an offline tool-calling loop for local language models.
#[derive(Parser)]
#[command(name = "governor", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "governor.toml")]
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

    /// Print the system prompt the model would be primed with.
    Prompt {
        /// Replay script whose tools are registered.
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Run one query against a replay script, streaming the answer.
    Replay {
        /// Replay script (TOML).
        script: PathBuf,

        /// The user query.
        query: String,

        /// Approve tools that ask for confirmation.
        #[arg(long)]
        approve: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter(cli.verbose, &config))),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
        Commands::Prompt { script } => cmd_prompt(&config, script.as_deref())?,
        Commands::Replay {
            script,
            query,
            approve,
        } => cmd_replay(config, &script, &query, approve)?,
    }

    Ok(())
}

/// Configured level, raised by each `-v`.
fn log_filter(verbose: u8, config: &AppConfig) -> &str {
    match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    }
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

fn cmd_prompt(config: &AppConfig, script: Option<&Path>) -> Result<()> {
    let mut registry = ToolRegistry::from_config(&config.registry);
    if let Some(path) = script {
        ReplayScript::load(path)?.register_tools(&mut registry)?;
    }
    let template = ChatTemplate::new(config.template.clone());
    print!("{}", template.render_system(&registry.build_system_prompt()?));
    Ok(())
}

fn cmd_replay(config: AppConfig, script_path: &Path, query: &str, approve: bool) -> Result<()> {
    let script = ReplayScript::load(script_path)?;
    let mut registry = ToolRegistry::from_config(&config.registry);
    script.register_tools(&mut registry)?;

    let model_path = config
        .model
        .path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| script_path.to_path_buf());
    let engine = ReplayEngine::from_script(&script);
    let mut governor = Governor::new(config, Arc::new(registry), engine)?;
    governor
        .load_model(&model_path)
        .with_context(|| format!("failed to load '{}'", model_path.display()))?;

    let mut stdout = std::io::stdout();
    let hooks = ExecuteHooks::new()
        .with_tokens(|chunk| {
            let _ = write!(stdout, "{chunk}");
            let _ = stdout.flush();
        })
        .with_progress(|event| {
            if let GovernorEvent::ToolCallStarted { name } = event {
                info!(tool = %name, "Calling tool");
            }
        })
        .with_confirmation(|invocation| {
            info!(tool = %invocation.name, approved = approve, "Confirmation requested");
            approve
        });
    let outcome = governor.execute(query, hooks);
    println!();

    if let Some(metrics) = outcome.metrics {
        eprintln!(
            "iterations: {}, tool calls: {}",
            metrics.iteration_count, metrics.tool_calls_made
        );
    }
    match outcome.status {
        GovernorStatus::Success(_) => Ok(()),
        GovernorStatus::Timeout(reason) => bail!("timed out: {reason}"),
        GovernorStatus::Error(message) => bail!("session failed: {message}"),
    }
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("invalid config '{}'", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor_test_utils::config::{TempFile, TestConfigBuilder};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_log_filter_raised_by_verbosity() {
        let config = TestConfigBuilder::new().log_level("warn").build();
        assert_eq!(log_filter(0, &config), "warn");
        assert_eq!(log_filter(1, &config), "debug");
        assert_eq!(log_filter(3, &config), "trace");
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::parse_from(["governor", "-v", "replay", "s.toml", "What time is it?"]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Replay {
                script,
                query,
                approve,
            } => {
                assert_eq!(script, PathBuf::from("s.toml"));
                assert_eq!(query, "What time is it?");
                assert!(!approve);
            }
            _ => panic!("expected replay command"),
        }
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.governor.max_iterations, 5);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let file = TempFile::with_content("governor.toml", "[governor]\nmax_iterations = 0\n");
        let err = load_config(file.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("max_iterations"));
    }

    #[test]
    fn test_replay_script_session() {
        let script = TempFile::with_content(
            "script.toml",
            r#"
            [[tools]]
            name = "clock"
            description = "Current time."
            response = "12:00"

            [[turns]]
            text = '<tool_call name="clock" />'

            [[turns]]
            text = "It is noon."
            "#,
        );
        let config = TestConfigBuilder::new().build();
        cmd_replay(config, script.path(), "What time is it?", false).unwrap();
    }

    #[test]
    fn test_replay_reports_timeout() {
        let script = TempFile::with_content(
            "script.toml",
            r#"
            repeat_last_turn = true

            [[tools]]
            name = "clock"

            [[turns]]
            text = '<tool_call name="clock" />'
            "#,
        );
        let config = TestConfigBuilder::new().max_iterations(2).build();
        let err = cmd_replay(config, script.path(), "Loop", false).unwrap_err();
        assert!(err.to_string().contains("no final answer after 2 iterations"));
    }
}
