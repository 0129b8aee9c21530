use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use teachback_engine::config::Config;
use teachback_engine::engine::{KnowledgeGraph, ReviewScheduler};
use teachback_engine::storage::SqliteStorage;

/// Inspect a teachback database: knowledge graph, insights, due reviews.
#[derive(Parser)]
#[command(name = "teachback", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a user's knowledge graph as JSON.
    Graph {
        /// User to inspect.
        #[arg(long)]
        user: String,
    },
    /// Print a user's cross-loop progress summary as JSON.
    Insights {
        /// User to inspect.
        #[arg(long)]
        user: String,
    },
    /// List a user's due review schedules as JSON.
    Due {
        /// User to inspect.
        #[arg(long)]
        user: String,
    },
    /// Print one concept with the user's record and relationships.
    Concept {
        /// User to inspect.
        #[arg(long)]
        user: String,
        /// Concept ID.
        #[arg(long)]
        concept: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    let graph = KnowledgeGraph::new(storage.clone());
    let reviews = ReviewScheduler::new(storage, config.review.clone());

    match cli.command {
        Command::Graph { user } => {
            let view = graph.view(&user).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Insights { user } => {
            let insights = graph.insights(&user).await?;
            println!("{}", serde_json::to_string_pretty(&insights)?);
        }
        Command::Due { user } => {
            let due = reviews.find_due(&user).await?;
            println!("{}", serde_json::to_string_pretty(&due)?);
        }
        Command::Concept { user, concept } => {
            let detail = graph.concept_detail(&user, &concept).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        teachback_engine::config::LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        teachback_engine::config::LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
