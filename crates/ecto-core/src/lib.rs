//! ECTO Core Library
//!
//! Campaign orchestration for exploit testing against disposable blockchain
//! test networks:
//! - Provisions chain-node processes with readiness detection and a funded
//!   account pool
//! - Compiles and deploys synthesized contract variants with a pinned
//!   compiler toolchain
//! - Attaches a model-driven monitor per (variant, model) pair and only
//!   executes exploits once the monitor authorizes
//! - Settles every exploit independently and aggregates the outcomes

pub mod campaign;
pub mod config;
pub mod env;
pub mod error;
pub mod exploit;
pub mod monitor;
pub mod pipeline;
pub mod ports;
pub mod telemetry;

pub use campaign::{CampaignOrchestrator, CampaignResult};
pub use config::{
    CampaignConfig, ContractDescriptor, ModelConfig, ParamSpec, ProvisionerSettings,
    TestDescriptor, ACCOUNT_POOL,
};
pub use env::{
    ActiveMonitors, Environment, EnvironmentHandle, EnvironmentProvisioner, FundingStyle,
    NodeFlavor,
};
pub use error::{EctoError, Result};
pub use exploit::{
    run_exploits, CallStep, ExploitContext, ExploitOutcome, ExploitRegistry, ExploitScript,
    ScriptedExploit,
};
pub use monitor::{ConfigModelLoader, ModelLoader, Monitor, MonitorConfig, MonitorState};
pub use pipeline::{
    deploy, extract_compiler_version, resolve_constructor_params, CompiledContract,
    DeployedContract, SolcCompiler,
};
pub use ports::{free_ports, pick_port};
pub use telemetry::init_tracing;

/// ECTO version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
