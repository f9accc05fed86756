//! Command-line interface for stormcore.
//!
//! Provides commands for running a pipeline once, validating configuration,
//! serving the full core against events read from stdin, and printing the
//! resolved configuration.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{self, ResolvedConfig};
use crate::core::{CoreContext, StageRegistry};
use crate::domain::{EventDraft, ExecutionStatus};

/// stormcore - staged pipeline executor with a rule-driven event engine
#[derive(Parser, Debug)]
#[command(name = "stormcore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .stormcore/config.yaml in this or a parent directory)
    #[arg(short, long, global = true, env = "STORMCORE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a pipeline once and print the execution as JSON
    Run {
        /// Pipeline id
        pipeline_id: String,

        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Inline JSON input
        #[arg(long, conflicts_with = "input")]
        json: Option<String>,
    },

    /// Load the configuration and register every pipeline
    Validate,

    /// Run the core, reading event JSON lines from stdin until EOF or Ctrl-C
    Serve,

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let resolved = match &self.config {
            Some(path) => config::load_from(path)?,
            None => config::load()?,
        };

        match self.command {
            Commands::Run {
                pipeline_id,
                input,
                json,
            } => run_pipeline(&resolved, &pipeline_id, input, json).await,
            Commands::Validate => validate(&resolved),
            Commands::Serve => serve(&resolved).await,
            Commands::Config => show_config(&resolved),
        }
    }
}

/// Read the run input: inline JSON, a file, or piped stdin
fn read_input(input_file: Option<PathBuf>, inline: Option<String>) -> Result<serde_json::Value> {
    let raw = if let Some(json) = inline {
        json
    } else if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        return Ok(serde_json::Value::Null);
    };

    // Non-JSON input is passed through as a string
    Ok(serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::Value::String(raw.trim().to_string())))
}

/// Execute a pipeline once
async fn run_pipeline(
    resolved: &ResolvedConfig,
    pipeline_id: &str,
    input_file: Option<PathBuf>,
    inline: Option<String>,
) -> Result<()> {
    let input = read_input(input_file, inline)?;

    let context = CoreContext::from_config(resolved).await?;
    context.start().await;

    let execution_id = context.execute_pipeline(pipeline_id, input).await?;
    let execution = context.wait_pipeline(execution_id).await?;
    context.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&execution)?);

    match execution.status {
        ExecutionStatus::Completed => {
            eprintln!("\n[Execution {} completed]", execution.id);
            Ok(())
        }
        status => {
            eprintln!(
                "\n[Execution {} {}: {}]",
                execution.id,
                status,
                execution.error.as_deref().unwrap_or("no error recorded")
            );
            std::process::exit(1);
        }
    }
}

/// Register every configured pipeline without running anything
fn validate(resolved: &ResolvedConfig) -> Result<()> {
    let config = &resolved.config;
    config.validate()?;

    let mut registry = StageRegistry::new();
    for (name, spec) in &config.processors {
        registry.register_processor(name.clone(), spec.build(name));
    }
    for definition in config.pipelines.iter().cloned() {
        let id = definition.id.clone();
        registry
            .register(definition)
            .with_context(|| format!("Pipeline '{}' is invalid", id))?;
    }

    for id in registry.pipeline_ids() {
        let pipeline = registry.get(&id)?;
        println!("{:<24} {}", id, pipeline.stage_order().join(" -> "));
    }
    println!(
        "\n{} pipeline(s), {} rule(s), {} resource(s): OK",
        config.pipelines.len(),
        config.rules.len(),
        config.resources.len()
    );

    Ok(())
}

/// Run every sweep and feed stdin event lines to the ingest channel
async fn serve(resolved: &ResolvedConfig) -> Result<()> {
    let context = CoreContext::from_config(resolved).await?;
    context.start().await;
    let sink = context.event_sink();

    eprintln!("stormcore serving; write one event JSON object per line (Ctrl-C to stop)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<EventDraft>(&line) {
                    Ok(draft) => {
                        if !sink.emit(draft).await {
                            break;
                        }
                    }
                    Err(e) => eprintln!("Ignoring malformed event: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted");
                break;
            }
        }
    }

    // Give the ingest drain and one rule sweep a chance to see the last events
    let settle = context.rule_engine().settings().sweep_interval_ms;
    tokio::time::sleep(std::time::Duration::from_millis(settle)).await;
    let status = context.status().await;
    let summary = context.event_summary().await;
    context.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "status": status,
        "events": summary,
    }))?);

    Ok(())
}

/// Show resolved configuration
fn show_config(resolved: &ResolvedConfig) -> Result<()> {
    println!("Config file: {}", resolved
        .config_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!("Home:        {}", resolved.home.display());
    println!("Audit log:   {}", resolved
        .audit_log
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(disabled)".to_string()));
    println!();
    println!("{}", serde_yaml::to_string(&resolved.config)?);

    Ok(())
}
