//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod devices;
pub mod locate;
pub mod run;
pub mod serve;
pub mod stage;

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::global_config::GlobalConfig;
use crate::core::locator::Locator;
use crate::core::orchestrator::{Orchestrator, OrchestratorSettings, SelfExeLauncher};
use crate::core::registry::InFlightRegistry;
use crate::infra::devices::SystemInventory;
use crate::infra::dirs::FlashpipeDirs;
use crate::infra::listing::HttpListingFetcher;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the imaging API over HTTP
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "FLASHPIPE_LISTEN")]
        listen: Option<String>,
    },

    /// Run one imaging pipeline
    Run {
        /// Target whole-disk device (e.g. /dev/sdb, /dev/disk4, \\.\PhysicalDrive2)
        #[arg(short, long)]
        device: String,

        /// Image descriptor: URL, listing URL or local path
        #[arg(short, long)]
        image: String,

        /// Volume label applied while formatting
        #[arg(short, long)]
        label: Option<String>,

        /// Expected SHA-256 of the downloaded image
        #[arg(long)]
        sha256: Option<String>,

        /// Print events as push-event frames instead of progress bars
        #[arg(long)]
        sse: bool,
    },

    /// Run a single pipeline stage (child-process entry point)
    Stage {
        #[command(subcommand)]
        command: StageCommands,
    },

    /// Resolve an image descriptor without downloading it
    Locate {
        /// URL, listing URL or local path
        descriptor: String,
    },

    /// List candidate target devices
    Devices {
        /// Include system disks
        #[arg(long)]
        all: bool,
    },
}

/// Stage subcommands
///
/// Each prints one JSON object per line on stdout and exits non-zero on
/// failure.
#[derive(Subcommand, Debug)]
pub enum StageCommands {
    /// Clear the partition table and create one FAT32 partition
    Format {
        #[arg(long)]
        device: String,

        #[arg(long)]
        label: Option<String>,
    },

    /// Download an image with retries
    Fetch {
        #[arg(long)]
        url: String,

        #[arg(long)]
        dest: PathBuf,

        #[arg(long)]
        sha256: Option<String>,
    },

    /// Write an image to a device
    Write {
        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        device: String,

        /// Uncompressed image size, when known
        #[arg(long)]
        image_size: Option<u64>,

        /// Skip the privilege probe
        #[arg(long)]
        assume_privileged: bool,

        /// Never use the helper tool
        #[arg(long)]
        no_helper: bool,
    },

    /// Sanity-check the boot sector of a written device
    Verify {
        #[arg(long)]
        device: String,
    },
}

/// Configuration shared by every command
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: GlobalConfig,
    pub dirs: FlashpipeDirs,
    /// Explicit configuration file, forwarded to stage children
    pub config_path: Option<PathBuf>,
}

impl AppContext {
    /// Load configuration from `path`, or from the config directory
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let dirs = FlashpipeDirs::new();
        let config = match &path {
            Some(p) => GlobalConfig::load_from_path(p),
            None => GlobalConfig::load(&dirs),
        }
        .context("Failed to load configuration")?;
        Ok(Self {
            config,
            dirs,
            config_path: path,
        })
    }

    /// Locator honoring the configured limits and timeouts
    pub fn locator(&self) -> Locator<HttpListingFetcher> {
        Locator::new(HttpListingFetcher::new(
            self.config.download_timeout(),
            self.config.connect_timeout(),
        ))
        .with_limits(
            self.config.max_listing_depth(),
            self.config.max_listing_visits(),
        )
    }

    /// Orchestrator launching stages from this executable
    pub fn orchestrator(&self, registry: Arc<dyn InFlightRegistry>) -> Result<Orchestrator> {
        let mut launcher = SelfExeLauncher::current().context("Cannot locate own executable")?;
        if let Some(path) = &self.config_path {
            launcher = launcher.with_args(vec!["--config".to_string(), path.display().to_string()]);
        }
        Ok(Orchestrator::new(
            Arc::new(launcher),
            registry,
            Arc::new(SystemInventory::new()),
            Arc::new(self.locator()),
            OrchestratorSettings::from_config(&self.config, &self.dirs),
        ))
    }
}

impl Commands {
    /// Execute the command
    pub async fn run(self, ctx: &AppContext) -> Result<()> {
        match self {
            Self::Serve { listen } => serve::execute(ctx, listen).await,
            Self::Run {
                device,
                image,
                label,
                sha256,
                sse,
            } => {
                let options = run::RunOptions {
                    device,
                    image,
                    label,
                    sha256,
                    sse,
                };
                run::execute(ctx, options).await
            }
            Self::Stage { command } => match command {
                StageCommands::Format { device, label } => stage::format(ctx, &device, label.as_deref()),
                StageCommands::Fetch { url, dest, sha256 } => {
                    stage::fetch(ctx, &url, &dest, sha256.as_deref()).await
                }
                StageCommands::Write {
                    image,
                    device,
                    image_size,
                    assume_privileged,
                    no_helper,
                } => {
                    let options = stage::WriteOptions {
                        image,
                        device,
                        image_size,
                        assume_privileged,
                        no_helper,
                    };
                    stage::write(ctx, &options)
                }
                StageCommands::Verify { device } => stage::verify(&device),
            },
            Self::Locate { descriptor } => locate::execute(ctx, &descriptor).await,
            Self::Devices { all } => devices::execute(all),
        }
    }
}
