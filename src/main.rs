use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batchr::cli::{Cli, Commands, SimulateOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchr=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            chats,
            turns,
            reply,
            draft,
            cache_id,
            max_tokens,
        } => {
            batchr::cli::simulate(SimulateOptions {
                config: cli.config,
                chats,
                turns,
                reply,
                draft,
                cache_id,
                max_tokens,
            })
            .await?;
        }
        Commands::Config => {
            batchr::cli::config(cli.config).await?;
        }
    }

    Ok(())
}
