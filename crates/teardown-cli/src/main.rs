//! Teardown CLI
//!
//! Destroys clusters recorded in an install directory's `metadata.json`.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use teardown_cli::{Cli, Result};
use teardown_destroy::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    cli.run(Registry::builtin()).await
}
