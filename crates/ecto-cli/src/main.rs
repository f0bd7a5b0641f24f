//! ECTO - Exploit Campaign Test Orchestrator CLI
//!
//! ## Commands
//!
//! - `run`: execute a full campaign from a config file
//! - `env check`: provision one environment, print its endpoint and funded
//!   accounts, then tear it down

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use ecto_core::{
    free_ports, pick_port, CampaignConfig, CampaignOrchestrator, EnvironmentProvisioner,
    ExploitRegistry, NodeFlavor, ProvisionerSettings, ScriptedExploit,
};

#[derive(Parser)]
#[command(name = "ecto")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Exploit Campaign Test Orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a campaign from a config file
    Run {
        /// Campaign config file
        #[arg(short, long, default_value = "campaign.json")]
        config: PathBuf,

        /// Directory of scripted exploits (one `<name>.json` per configured
        /// test file)
        #[arg(long, default_value = "exploits")]
        scripts: PathBuf,

        /// Exit non-zero when any exploit outcome failed
        #[arg(long)]
        strict: bool,
    },

    /// Environment utilities
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },
}

#[derive(Subcommand)]
enum EnvAction {
    /// Provision one environment, print its details, tear it down
    Check {
        /// Environment flavor name
        #[arg(long, default_value = "anvil")]
        flavor: String,

        /// First port of the scan range
        #[arg(long, default_value_t = 3000)]
        base_port: u16,

        /// Await funding confirmation before reporting
        #[arg(long)]
        confirm_funding: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ecto_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            scripts,
            strict,
        } => cmd_run(&config, &scripts, strict).await,
        Commands::Env { action } => match action {
            EnvAction::Check {
                flavor,
                base_port,
                confirm_funding,
            } => cmd_env_check(&flavor, base_port, confirm_funding).await,
        },
    }
}

async fn cmd_run(config_path: &Path, scripts_dir: &Path, strict: bool) -> Result<()> {
    let config = CampaignConfig::load(config_path).context("failed to load campaign config")?;
    let registry = build_registry(&config, scripts_dir);

    let orchestrator = CampaignOrchestrator::new(config, registry);
    let result = orchestrator.run().await.context("campaign failed")?;

    println!(
        "campaign {}: {} succeeded, {} failed",
        result.campaign_id, result.successes, result.failures
    );
    for outcome in &result.failed {
        println!(
            "  FAIL {} / {}: {}",
            outcome.contract,
            outcome.exploit,
            outcome.reason.as_deref().unwrap_or("no reason recorded")
        );
    }

    if strict && result.failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Load one scripted exploit per configured test file. Missing script files
/// are tolerated here; the orchestrator records them as failures when their
/// name comes up.
fn build_registry(config: &CampaignConfig, scripts_dir: &Path) -> ExploitRegistry {
    let mut registry = ExploitRegistry::new();
    for suite in &config.tests {
        for file in &suite.files {
            let path = scripts_dir.join(format!("{file}.json"));
            match ScriptedExploit::load(&path) {
                Ok(mut script) => {
                    // Registry lookups go by the configured file name.
                    script.name = file.clone();
                    info!(exploit = %file, "registered scripted exploit");
                    registry.register(Arc::new(script));
                }
                Err(e) => {
                    warn!(exploit = %file, "no scripted exploit loaded: {e}");
                }
            }
        }
    }
    registry
}

async fn cmd_env_check(flavor_name: &str, base_port: u16, confirm_funding: bool) -> Result<()> {
    let flavor = NodeFlavor::by_name(flavor_name)
        .with_context(|| format!("unknown environment flavor {flavor_name}"))?;
    let settings = ProvisionerSettings {
        base_port,
        ..ProvisionerSettings::default()
    };

    let free = free_ports(settings.base_port, settings.scan_width).await?;
    let port = pick_port(&free).context("no free port in scan range")?;

    let provisioner = EnvironmentProvisioner::new(flavor, settings);
    let mut env = provisioner.provision(port).await?;

    if confirm_funding {
        env.wait_funded().await.context("funding confirmation failed")?;
    }

    println!("rpc endpoint: {}", env.handle.rpc_url);
    println!("node pid:     {}", env.handle.pid);
    println!(
        "funded accounts{}:",
        if confirm_funding { "" } else { " (unconfirmed)" }
    );
    for (index, account) in env.handle.accounts.iter().enumerate() {
        println!("  [{index}] {account:#x}");
    }

    env.terminate().await;
    Ok(())
}
