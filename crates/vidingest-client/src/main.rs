#![warn(missing_docs)]

//! vidingest-ctl: offline checks for client configs and credentials

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vidingest_client::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(cli.json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!cli.json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::debug!("vidingest-ctl starting");
    cli.run().await
}
