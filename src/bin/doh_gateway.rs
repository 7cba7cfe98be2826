use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use doh_gateway::auth::TokenIssuer;
use doh_gateway::config::{
    ConfigWriteAction, DEFAULT_TOKEN_TYPE, GatewayConfig, default_config_path,
    write_default_config,
};
use doh_gateway::gateway::Gateway;
use doh_gateway::{server, telemetry};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "doh-gateway", version, about = "DNS-over-HTTPS gateway backed by JSON resolvers", long_about = None)]
struct Args {
    /// Override path to the gateway config (doh-gateway.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway listeners (default)
    Serve,
    /// Write the commented default configuration
    WriteConfig {
        /// Replace an existing file
        #[arg(long, action = ArgAction::SetTrue)]
        overwrite: bool,
    },
    /// Sign a two-hour access token with an RSA private key
    IssueToken {
        /// PEM private key matching the gateway's public key
        #[arg(long, value_name = "PATH")]
        key: PathBuf,

        #[arg(long, default_value = DEFAULT_TOKEN_TYPE)]
        token_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config_path, args.verbose).await,
        Command::WriteConfig { overwrite } => {
            let outcome = write_default_config(&config_path, overwrite)?;
            let verb = match outcome.action {
                ConfigWriteAction::Created => "Created",
                ConfigWriteAction::Updated => "Updated",
                ConfigWriteAction::Skipped => "Skipped existing",
            };
            println!("{verb} {}", outcome.path.display());
            Ok(())
        }
        Command::IssueToken { key, token_type } => {
            let issuer = TokenIssuer::load(&key, token_type)?;
            println!("{}", issuer.issue()?);
            Ok(())
        }
    }
}

async fn serve(config_path: PathBuf, verbose: bool) -> Result<()> {
    let config = GatewayConfig::load_or_default(&config_path)?;
    telemetry::init_tracing(verbose, &config.logging)?;

    if !config_path.exists() {
        warn!(
            path = %config_path.display(),
            "Gateway config missing; using built-in defaults"
        );
    }
    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            warn!(issue = %issue, "Invalid gateway configuration");
        }
        bail!("{} configuration problem(s) in {}", issues.len(), config_path.display());
    }

    let gateway = Gateway::from_config(&config).await?;
    info!(config = %config_path.display(), "Starting DoH gateway");
    server::run(&config, gateway).await
}
