use anyhow::Result;
use appboot::{cli::Cli, run};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
