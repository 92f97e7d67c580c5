//! CLI commands
//!
//! Drives the batching engine with the scripted backend, so scheduling and
//! caching behaviour can be observed without model weights.

mod config;
mod simulate;

pub use config::config;
pub use simulate::{simulate, SimulateOptions};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Batchr - continuous-batching inference core
#[derive(Parser)]
#[command(name = "batchr")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (YAML, or JSON by extension)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run concurrent synthetic chats against the scripted model
    Simulate {
        /// Number of concurrent chats
        #[arg(long, default_value = "8")]
        chats: usize,

        /// User turns per chat
        #[arg(long, default_value = "3")]
        turns: usize,

        /// Reply the scripted model produces for every turn
        #[arg(long, default_value = "The quick brown fox jumps over the lazy dog.")]
        reply: String,

        /// Attach a draft model producing this reply (enables speculation
        /// when speculative.draft_tokens > 0)
        #[arg(long)]
        draft: Option<String>,

        /// Cache id shared by every chat
        #[arg(long)]
        cache_id: Option<String>,

        /// Maximum tokens per reply
        #[arg(long, default_value = "256")]
        max_tokens: usize,
    },

    /// Print the validated effective configuration
    Config,
}
