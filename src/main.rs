mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, CrdAction, Commands};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let pretty = std::env::var("LOG_FORMAT").as_deref() == Ok("pretty");

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if pretty {
        subscriber.init();
    } else {
        subscriber.json().init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::List { resource } => {
            commands::list::run(resource).await?;
        }
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Run => commands::run::run().await?,
    }

    Ok(())
}
