mod cli;

use anyhow::Context;
use anyhow::anyhow;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atelier_core::config::Config;
use atelier_core::config::ConfigOverrides;

use crate::cli::Cli;
use crate::cli::Command;
use crate::cli::ServeArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let ServeArgs {
        addr,
        workspace_root,
        scaffold_dir,
        curated_dir,
        model_command,
        sandbox_mode,
    } = args;

    let model_command = match model_command {
        Some(raw) => Some(
            shlex::split(&raw).ok_or_else(|| anyhow!("could not parse --model-command: {raw}"))?,
        ),
        None => None,
    };

    let overrides = ConfigOverrides {
        workspace_root,
        scaffold_dir,
        curated_dir,
        model_command,
        sandbox_mode,
    };

    // Configuration errors (missing API key, bad port range, unsupported
    // sandbox mode) exit non-zero before anything listens.
    let config = Config::load_with_cli_overrides(overrides).context("invalid configuration")?;

    info!(
        "starting atelier: workspaces under {:?}, preview ports {}-{}",
        config.workspace_root, config.port_floor, config.port_ceiling
    );
    atelier_server::run_serve(addr.as_deref(), config)
        .await
        .context("server exited with an error")?;
    Ok(())
}
