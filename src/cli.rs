use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "lifai-rs",
    version,
    about = "Rewrite selected text in place with a local Ollama model"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Run in test mode (Enter triggers the default prompt)
    #[arg(long)]
    pub test: bool,

    /// Prompt used by the trigger shortcut instead of the configured default
    #[arg(long, value_name = "NAME")]
    pub prompt: Option<String>,

    /// Read configuration from this file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the prompt templates available after config overrides
    Prompts,
}
