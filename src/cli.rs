use clap::Parser;
use std::path::PathBuf;

/// Conversational front-end for completion-style providers
#[derive(Debug, Parser)]
#[command(name = "converse")]
#[command(version)]
#[command(about = "Conversational front-end for completion-style providers", long_about = None)]
pub struct Args {
    /// Model name
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Provider (default: config/provider or "openai")
    #[arg(long = "provider")]
    pub provider: Option<String>,

    /// Turn kind: completion, chat, edit, embedding, predict
    #[arg(short = 'k', long = "kind", default_value = "completion")]
    pub kind: String,

    /// Wait for the full response instead of streaming deltas
    #[arg(long = "no-stream")]
    pub no_stream: bool,

    /// Start a line-based interactive conversation
    #[arg(short = 'i', long = "interactive")]
    pub interactive: bool,

    /// Also record prompt/completion training pairs
    #[arg(long = "train")]
    pub train: bool,

    /// Where to write session snapshots (default: state dir)
    #[arg(long = "transcript-dir", value_name = "DIR")]
    pub transcript_dir: Option<PathBuf>,

    /// Prompt text (positional) (used when not interactive)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}
