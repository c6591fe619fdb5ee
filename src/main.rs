//! oiva - ask a chat model from your shell.
//!
//! Sends the question to an OpenAI-compatible chat completion endpoint and
//! streams the answer to stdout, optionally with markdown code fences removed
//! so commands can be copied straight from the terminal.

mod config;
mod fence;
mod llm;
mod output;

use anyhow::Result;
use clap::Parser;
use config::{Config, ConfigError};
use fence::OutputMode;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "oiva")]
#[command(author, version, about = "Ask a chat model from your shell")]
#[command(long_about = "Ask a chat model from your shell.\n\nEverything after the options is sent as the question, e.g.\n  oiva how do I find files larger than 100MB")]
struct Cli {
    /// Config file (default: config.toml next to the executable)
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the model from the config file
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// Print the answer as received, keeping code fences
    #[arg(long)]
    raw: bool,

    /// Log request details to stderr
    #[arg(short = 'v', long)]
    verbose: bool,

    /// The question to ask
    #[arg(value_name = "QUESTION", trailing_var_arg = true, allow_hyphen_values = true)]
    query: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let query = cli.query.join(" ");
    if query.trim().is_empty() {
        print_usage();
        std::process::exit(1);
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report_config_error(&e);
            std::process::exit(1);
        }
    };
    if let Some(model) = cli.model {
        config.api.model = model;
    }

    let mode = if cli.raw {
        OutputMode::Raw
    } else {
        OutputMode::from_clean_output(config.output.clean_output)
    };
    debug!(model = %config.api.model, ?mode, "configuration loaded");

    if let Err(e) = ask(&config, &query, mode).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Stream the answer to `query` to stdout.
async fn ask(config: &Config, query: &str, mode: OutputMode) -> Result<()> {
    let client = llm::OpenAIClient::from_config(config)?;
    let mut stream = client.stream_chat(&config.system.prompt, query).await?;

    let stdout = std::io::stdout().lock();
    output::render_stream(&mut stream, output::Renderer::new(mode, stdout)).await?;
    Ok(())
}

/// Logs go to stderr so they never mix with the answer.
fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "oiva=debug" } else { "oiva=warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(level.parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .init();
    Ok(())
}

fn print_usage() {
    eprintln!("Usage: oiva <your question>");
    eprintln!("Example: oiva how do I list files sorted by size");
}

fn report_config_error(error: &ConfigError) {
    eprintln!("Error: {}", error);
    if let ConfigError::NotFound { .. } = error {
        eprintln!("Place a config file next to the oiva executable or pass --config <PATH>.");
        match Config::default_toml() {
            Ok(example) => eprintln!("Example config:\n\n{}", example),
            Err(e) => debug!(error = %e, "could not render example config"),
        }
    }
}
