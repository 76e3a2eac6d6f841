mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None => commands::run::run(!cli.disable_scale_down).await?,
        Some(Commands::Version) => commands::version::run()?,
        Some(Commands::Check) => commands::check::run().await?,
        Some(Commands::Crd { action }) => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Some(Commands::Store { action }) => commands::store::run(action).await?,
    }

    Ok(())
}
