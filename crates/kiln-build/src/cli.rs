//! Kiln CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use kiln_common::EnvVar;
use kiln_image::daemon::DaemonClient;

use crate::builder::{BuildRequest, Builder, Platform};
use crate::scripts;
use crate::strategy::CommandStrategy;

/// Kiln - source-to-image function builder
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Kiln commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build a function image from a source tree
    Build {
        /// Source tree root
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Tag for the output image
        #[arg(short, long)]
        image: String,

        /// Runtime identifier (go, node, python, quarkus, ...)
        #[arg(short, long, default_value = "")]
        runtime: String,

        /// Builder image, overriding the runtime default
        #[arg(long)]
        builder_image: Option<String>,

        /// Target platform as os/architecture (at most one)
        #[arg(long = "platform")]
        platforms: Vec<String>,

        /// Build-time environment (KEY=VALUE, may reference {{ env:NAME }})
        #[arg(short, long = "env")]
        envs: Vec<String>,

        /// Assemble engine executable
        #[arg(long, default_value = CommandStrategy::DEFAULT_PROGRAM)]
        assembler: PathBuf,
    },

    /// Print the scripts URL advertised by an image
    ScriptUrl {
        /// Image reference
        image: String,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Build {
                path,
                image,
                runtime,
                builder_image,
                platforms,
                envs,
                assembler,
            } => {
                let platforms = platforms
                    .iter()
                    .map(|p| Platform::parse(p))
                    .collect::<Result<Vec<_>, _>>()?;

                let build_envs: Vec<EnvVar> = envs
                    .iter()
                    .filter_map(|env| match env.split_once('=') {
                        Some((name, value)) if !name.is_empty() => {
                            Some(EnvVar::new(name, value))
                        }
                        _ => {
                            eprintln!(
                                "Warning: Invalid env format '{}'. Expected KEY=VALUE",
                                env
                            );
                            None
                        }
                    })
                    .collect();

                let request = BuildRequest {
                    source_root: std::path::absolute(&path)?,
                    runtime,
                    image: image.clone(),
                    builder_image,
                    platforms,
                    build_envs,
                };

                let daemon = Arc::new(DaemonClient::from_env());
                let strategy = Arc::new(CommandStrategy::new(assembler));
                let builder = Builder::new(strategy, daemon).with_verbose(self.verbose);

                builder.build(&request).await?;

                println!("Build complete!");
                println!("  Image: {}", image);
                Ok(())
            }

            Commands::ScriptUrl { image } => {
                let daemon = DaemonClient::from_env();
                let url = scripts::script_url(&daemon, &image).await?;
                if url.is_empty() {
                    println!("(engine default)");
                } else {
                    println!("{url}");
                }
                Ok(())
            }
        }
    }
}
