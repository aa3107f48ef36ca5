//! Command-line interface module
//!
//! This module handles argument parsing and output formatting.
//! It contains no business logic - that belongs in the [`crate::core`] module.

pub mod commands;
pub mod output;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use commands::{AppContext, Commands};

/// flashpipe - resolve, download and flash OS images
///
/// Writes operating-system images to removable cards and disks, streaming
/// progress to the terminal or to HTTP observers.
#[derive(Parser, Debug)]
#[command(name = "flashpipe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to config.toml in the config directory)
    #[arg(long, global = true, env = "FLASHPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        if let Some(cmd) = self.command {
            let ctx = AppContext::load(self.config)?;
            cmd.run(&ctx).await
        } else {
            // No subcommand provided, show help
            use clap::CommandFactory;
            let mut cmd = Self::command();
            cmd.print_help()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commands::StageCommands;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stage_write() {
        let cli = Cli::parse_from([
            "flashpipe",
            "stage",
            "write",
            "--image",
            "/tmp/os.img.xz",
            "--device",
            "/dev/sdb",
            "--image-size",
            "1024",
        ]);
        match cli.command {
            Some(Commands::Stage {
                command:
                    StageCommands::Write {
                        image,
                        device,
                        image_size,
                        ..
                    },
            }) => {
                assert_eq!(image, PathBuf::from("/tmp/os.img.xz"));
                assert_eq!(device, "/dev/sdb");
                assert_eq!(image_size, Some(1024));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["flashpipe", "devices", "-vv", "--json"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
    }
}
