//! Error taxonomy for campaign orchestration.

use std::time::Duration;

/// Errors produced by any stage of a campaign.
///
/// Pipeline-stage errors (`VersionParse`, `Compile`, `ConstructorResolution`,
/// `Deployment`) are caught by the orchestrator's per-triple handler and
/// converted into failure outcomes; they never abort a campaign.
#[derive(Debug, thiserror::Error)]
pub enum EctoError {
    #[error("port scan found no free port (base {base}, width {width})")]
    NoFreePort { base: u16, width: u16 },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("node did not report readiness within {0:?}")]
    ProvisioningTimeout(Duration),

    #[error("cannot parse compiler version pragma: {0}")]
    VersionParse(String),

    #[error("compilation failed for {unit}: {diagnostics}")]
    Compile { unit: String, diagnostics: String },

    #[error("constructor parameter resolution failed: {0}")]
    ConstructorResolution(String),

    #[error("deployment failed: {0}")]
    Deployment(String),

    #[error("exploit execution failed: {0}")]
    ExploitExecution(String),

    #[error("aggregation invariant violated: {0}")]
    Aggregation(String),

    #[error("invalid campaign config: {0}")]
    Config(String),

    #[error("rpc error: {0}")]
    Rpc(#[from] web3::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for campaign operations.
pub type Result<T> = std::result::Result<T, EctoError>;
