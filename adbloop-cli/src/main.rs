//! CLI for the adbloop embedded debug bridge client.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod ops;

use std::net::IpAddr;
use std::path::PathBuf;

use adbloop::Config;
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "adbloop",
    version,
    about = "Talk to this device's own debug daemon over loopback"
)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug daemon TCP port.
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Host to try instead of interface discovery (repeatable).
    #[arg(long = "host", global = true)]
    hosts: Vec<IpAddr>,

    /// Directory holding the RSA key pair.
    #[arg(long, global = true)]
    key_dir: Option<PathBuf>,

    /// More diagnostics on stderr (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Grant runtime permissions, app-ops and settings to a package.
    Grant(ops::GrantArgs),

    /// Install a package file that is already on the device.
    Install {
        /// On-device path of the package file.
        path: String,
    },

    /// Run a shell script that is already on the device.
    Script(ops::ScriptArgs),

    /// Print the public key in the daemon's authorized-keys format.
    Pubkey,

    /// Print the effective configuration as JSON.
    Config,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.dispatch().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("adbloop: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Diagnostics go to stderr; `RUST_LOG` overrides the `-v` level.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    /// Runs the subcommand. `Ok(false)` means the operation itself failed.
    async fn dispatch(self) -> Result<bool> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "adbloop", &mut std::io::stdout());
            return Ok(true);
        }

        let config = self.load_config()?;
        tracing::debug!(
            port = config.port,
            hosts = ?config.hosts,
            key_dir = %config.key_dir.display(),
            "effective configuration"
        );
        match self.command {
            Command::Grant(args) => ops::grant(config, args).await,
            Command::Install { path } => ops::install(config, path).await,
            Command::Script(args) => ops::script(config, args).await,
            Command::Pubkey => ops::pubkey(&config),
            Command::Config => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(true)
            }
            Command::Completion { .. } => Ok(true),
        }
    }

    /// File configuration (or defaults) with command-line overrides applied.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.hosts.is_empty() {
            config.hosts.clone_from(&self.hosts);
        }
        if let Some(dir) = &self.key_dir {
            config.key_dir.clone_from(dir);
        }
        Ok(config)
    }
}
