use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pipeboard_core::PipelineMetrics;
use pipeboard_notion::{DealSource, NotionClient, NotionConfig};

#[derive(Debug, Parser)]
#[command(name = "pipeboard-cli")]
#[command(about = "Pipeboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve,
    Fetch,
    Properties,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().compact().init();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            pipeboard_web::serve_from_env().await?;
        }
        Commands::Fetch => {
            let client = NotionClient::new(NotionConfig::from_env()?)?;
            let deals = client.fetch_deals().await?;
            let metrics = PipelineMetrics::compute(&deals, Utc::now());
            println!(
                "fetch complete: deals={} won={} lost={} total_value={:.2}",
                metrics.total, metrics.won, metrics.lost, metrics.total_value
            );
        }
        Commands::Properties => {
            let client = NotionClient::new(NotionConfig::from_env()?)?;
            for property in client.list_properties().await? {
                println!("{}\t{}", property.name, property.kind);
            }
        }
    }

    Ok(())
}
