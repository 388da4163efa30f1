//! Updraft CLI Module
//! Command-line interface for the update client and publisher tooling

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod formatter;

#[derive(Parser, Debug)]
#[command(name = "updraft")]
#[command(version)]
#[command(about = "Verified update delivery for self-published artifacts", long_about = None)]
pub struct Cli {
    /// Client data directory (defaults to the platform data dir)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the client configuration
    Init {
        /// Backend base URL serving /latest.json
        #[arg(short, long)]
        backend_url: String,

        /// Bearer key for protected backend endpoints
        #[arg(short = 'k', long, default_value = "")]
        api_key: String,

        /// Where downloaded artifacts are stored
        #[arg(long)]
        download_dir: Option<PathBuf>,

        /// Installed target binary, probed with --version
        #[arg(long)]
        installed_binary: Option<PathBuf>,
    },

    /// Show the latest published artifact and the installed version
    Check,

    /// Start downloading the latest artifact
    Download {
        /// Stop once the transfer finishes; run `verify` later
        #[arg(long)]
        no_verify: bool,
    },

    /// Verify the current download session, retrying until it finishes
    Verify,

    /// Show session, verification and trust state
    Status,

    /// Forget the current download session
    Discard,

    /// Signer trust management
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },

    /// Register a push token with the backend
    Register {
        /// Push endpoint token
        token: String,

        /// Client platform (android, ios, desktop)
        #[arg(short, long)]
        platform: Option<String>,
    },

    /// Publisher tooling
    Publish {
        #[command(subcommand)]
        action: PublishAction,
    },

    /// Run one server refresh using the server environment
    Scrape,
}

#[derive(Subcommand, Debug)]
pub enum TrustAction {
    /// Show the pinned and observed signers
    Show,
    /// Pin the most recently observed signer
    Accept,
    /// Forget all signer information
    Reset,
}

#[derive(Subcommand, Debug)]
pub enum PublishAction {
    /// Generate a signing key
    Keygen {
        /// Output key file
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Embed a signature into an artifact
    Sign {
        /// Artifact to sign
        input: PathBuf,

        /// Signing key file
        #[arg(short, long)]
        key: PathBuf,

        /// Output path (defaults to signing in place)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the signer fingerprint of a key
    Fingerprint {
        /// Signing key file
        key: PathBuf,
    },
}

impl Cli {
    pub fn get_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("updraft")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download_flags() {
        let cli = Cli::parse_from(["updraft", "--format", "json", "download", "--no-verify"]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Download { no_verify: true }));
    }

    #[test]
    fn test_explicit_data_dir() {
        let cli = Cli::parse_from(["updraft", "--data-dir", "/tmp/u", "trust", "accept"]);
        assert_eq!(cli.get_data_dir(), PathBuf::from("/tmp/u"));
        assert!(matches!(
            cli.command,
            Commands::Trust {
                action: TrustAction::Accept
            }
        ));
    }
}
