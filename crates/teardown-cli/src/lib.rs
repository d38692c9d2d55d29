//! Teardown CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use teardown_destroy::Registry;

/// Teardown - destroy provisioned clusters
#[derive(Parser, Debug)]
#[command(name = "teardown")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info", env = "TEARDOWN_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Destroy the cluster described by an install directory
    Destroy(commands::destroy::DestroyArgs),
    /// List the platforms this build can destroy
    Platforms,
}

impl Cli {
    /// Run the CLI command against the given platform registry
    pub async fn run(self, registry: Registry) -> Result<()> {
        match self.command {
            Commands::Destroy(args) => commands::destroy::run(args, &registry).await,
            Commands::Platforms => {
                for platform in registry.platforms() {
                    println!("{}", platform);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_destroy_with_defaults() {
        let cli = Cli::try_parse_from(["teardown", "destroy", "--dir", "/tmp/install"]).unwrap();
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Destroy(args) => {
                assert_eq!(args.dir, std::path::PathBuf::from("/tmp/install"));
                assert_eq!(args.poll_interval_secs, 10);
                assert_eq!(args.volume_timeout_secs, 600);
                assert!(!args.fail_on_volume_timeout);
                assert!(args.kubeconfig.is_none());
            }
            other => panic!("expected destroy, got {other:?}"),
        }
    }

    #[test]
    fn log_level_is_global() {
        let cli = Cli::try_parse_from(["teardown", "platforms", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Platforms));
    }

    #[tokio::test]
    async fn platforms_lists_registry() {
        let cli = Cli::try_parse_from(["teardown", "platforms"]).unwrap();
        assert!(cli.run(Registry::builtin()).await.is_ok());
    }
}
