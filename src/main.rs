//! shortcert - short-lived SSH certificates from OIDC identity

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use shortcert::{
    cli::{Cli, Command},
    client,
    config::Config,
    issuer::CaSigner,
    server::CertServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration failure");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Command::Login) => client::login(config).await,
        Some(Command::CaKey) => print_ca_key(&config),
        Some(Command::Serve) | None => run_server(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "shortcert failed");
            ExitCode::FAILURE
        }
    }
}

/// Run the issuance server until signaled.
async fn run_server(config: Config) -> shortcert::Result<()> {
    CertServer::new(config)?.run().await
}

/// Print the CA public key line for distribution.
fn print_ca_key(config: &Config) -> shortcert::Result<()> {
    let signer = CaSigner::load(&config.ca.ca_key_path)?;
    let mut public = signer.public_key();
    public.set_comment(&config.ca.ca_comment);
    println!("{}", public.to_openssh()?);
    Ok(())
}
