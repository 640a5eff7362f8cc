use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

use atelier_core::config::SandboxMode;

#[derive(Debug, Parser)]
#[command(name = "atelier", about = "AI app-builder orchestration runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestration server.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Address to listen on (default 127.0.0.1:8080).
    #[arg(long)]
    pub addr: Option<String>,

    /// Directory under which per-session workspaces are created.
    #[arg(long, value_name = "DIR")]
    pub workspace_root: Option<PathBuf>,

    /// Project template copied into each fresh workspace.
    #[arg(long, value_name = "DIR")]
    pub scaffold_dir: Option<PathBuf>,

    /// Curated component library injected into each workspace.
    #[arg(long, value_name = "DIR")]
    pub curated_dir: Option<PathBuf>,

    /// Command line used to launch the reasoning-model subprocess.
    #[arg(long, value_name = "CMD")]
    pub model_command: Option<String>,

    /// Sandbox backend: local or cloud.
    #[arg(long, value_name = "MODE", value_parser = parse_sandbox_mode)]
    pub sandbox_mode: Option<SandboxMode>,
}

fn parse_sandbox_mode(raw: &str) -> Result<SandboxMode, String> {
    match raw {
        "local" => Ok(SandboxMode::Local),
        "cloud" => Ok(SandboxMode::Cloud),
        other => Err(format!("unknown sandbox mode `{other}` (local|cloud)")),
    }
}
