//! Command-line interface definitions for `shortcert`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap` and the
//! [`Command`] subcommand enum that drives the binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Short-lived SSH certificates from OIDC identity
///
/// Run `serve` to start the issuance server, or `login` on a workstation to
/// obtain a certificate and wire it into `~/.ssh`.
#[derive(Parser, Debug)]
#[command(name = "shortcert")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (YAML)
    #[arg(short, long, env = "SHORTCERT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(
        long,
        default_value = "info",
        env = "SHORTCERT_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "SHORTCERT_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand to run (defaults to server mode when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the issuance server (default when no subcommand is given)
    Serve,

    /// Obtain a certificate and install it into ~/.ssh
    Login,

    /// Print the CA public key line
    CaKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::parse_from(["shortcert", "serve"]);
        assert!(matches!(cli.command, Some(Command::Serve)));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn cli_defaults_to_no_subcommand() {
        let cli = Cli::parse_from(["shortcert"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn cli_parses_login_with_config() {
        let cli = Cli::parse_from(["shortcert", "--config", "/etc/shortcert.yaml", "login"]);
        assert!(matches!(cli.command, Some(Command::Login)));
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/etc/shortcert.yaml"))
        );
    }
}
