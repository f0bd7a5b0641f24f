//! Exploit script contract, registry, and settle-all execution.
//!
//! Every exploit is a named async callable receiving the chain client, the
//! environment handle, and the deployed contract. Scripts for one run are
//! spawned as independent tasks: a panic or error in one is recorded as that
//! script's failure only and never cancels its siblings.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use web3::contract::{Contract, Options};
use web3::transports::Http;
use web3::Web3;

use crate::config::ParamSpec;
use crate::env::EnvironmentHandle;
use crate::error::{EctoError, Result};
use crate::pipeline::{parse_u256, resolve_constructor_params, DeployedContract};

/// Everything a script needs to attack one deployed instance.
pub struct ExploitContext {
    pub client: Arc<Web3<Http>>,
    pub env: EnvironmentHandle,
    pub contract: DeployedContract,
}

/// One exploit attempt against one deployed contract variant.
#[async_trait]
pub trait ExploitScript: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `Ok(true)` when the exploit landed, `Ok(false)` when it ran
    /// to completion without succeeding, `Err` on execution failure.
    async fn run(&self, ctx: &ExploitContext) -> Result<bool>;
}

/// Name-indexed script store. Campaign configs reference scripts by name;
/// a configured name with no registered script degrades to a recorded
/// failure at run time.
#[derive(Default)]
pub struct ExploitRegistry {
    scripts: HashMap<String, Arc<dyn ExploitScript>>,
}

impl ExploitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, script: Arc<dyn ExploitScript>) {
        self.scripts.insert(script.name().to_string(), script);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExploitScript>> {
        self.scripts.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Result of one exploit attempt. Append-only once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploitOutcome {
    /// Variant-qualified contract identifier, e.g. `Vault-2`.
    pub contract: String,
    pub exploit: String,
    pub success: bool,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ExploitOutcome {
    pub fn succeeded(contract: &str, exploit: &str) -> Self {
        Self {
            contract: contract.to_string(),
            exploit: exploit.to_string(),
            success: true,
            reason: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(contract: &str, exploit: &str, reason: Option<String>) -> Self {
        Self {
            contract: contract.to_string(),
            exploit: exploit.to_string(),
            success: false,
            reason,
            recorded_at: Utc::now(),
        }
    }
}

/// Execute every named script concurrently and settle all of them.
///
/// Outcomes are returned in input order, one per name. A missing registry
/// entry, a `false` result, a returned error, and a panicking task all
/// settle as failures without affecting sibling scripts.
pub async fn run_exploits(
    registry: &ExploitRegistry,
    names: &[String],
    ctx: Arc<ExploitContext>,
    contract_label: &str,
) -> Vec<ExploitOutcome> {
    let mut handles = Vec::with_capacity(names.len());
    for name in names {
        match registry.get(name) {
            Some(script) => {
                let ctx = Arc::clone(&ctx);
                handles.push((
                    name.clone(),
                    Some(tokio::spawn(async move { script.run(&ctx).await })),
                ));
            }
            None => handles.push((name.clone(), None)),
        }
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        let outcome = match handle {
            None => ExploitOutcome::failed(
                contract_label,
                &name,
                Some("no exploit script registered under this name".to_string()),
            ),
            Some(handle) => match handle.await {
                Ok(Ok(true)) => ExploitOutcome::succeeded(contract_label, &name),
                Ok(Ok(false)) => ExploitOutcome::failed(contract_label, &name, None),
                Ok(Err(e)) => ExploitOutcome::failed(contract_label, &name, Some(e.to_string())),
                Err(e) => ExploitOutcome::failed(
                    contract_label,
                    &name,
                    Some(format!("script task died: {e}")),
                ),
            },
        };
        if outcome.success {
            info!(contract = %contract_label, exploit = %name, "exploit succeeded");
        } else {
            warn!(
                contract = %contract_label,
                exploit = %name,
                reason = ?outcome.reason,
                "exploit failed"
            );
        }
        outcomes.push(outcome);
    }
    outcomes
}

fn default_script_gas() -> u64 {
    3_000_000
}

/// One transaction of a scripted exploit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStep {
    /// Contract function to call.
    pub function: String,

    /// Call arguments, resolved against the environment like constructor
    /// parameters.
    #[serde(default)]
    pub args: Vec<ParamSpec>,

    /// Funded-account index the call is signed with.
    #[serde(default)]
    pub from: usize,

    /// Attached value, decimal or `0x`-prefixed hex.
    #[serde(default)]
    pub value: Option<String>,

    /// When set, the step passes only if the transaction reverts.
    #[serde(default)]
    pub expect_revert: bool,
}

/// Data-driven exploit: an ordered call sequence loaded from a JSON file.
/// The exploit succeeds when every step lands as expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedExploit {
    pub name: String,
    pub steps: Vec<CallStep>,
    #[serde(default = "default_script_gas")]
    pub gas: u64,
}

impl ScriptedExploit {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EctoError::ExploitExecution(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EctoError::ExploitExecution(format!("cannot parse {}: {e}", path.display()))
        })
    }
}

#[async_trait]
impl ExploitScript for ScriptedExploit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ExploitContext) -> Result<bool> {
        let abi_bytes = serde_json::to_vec(&ctx.contract.abi)?;
        let contract = Contract::from_json(ctx.client.eth(), ctx.contract.address, &abi_bytes)
            .map_err(|e| EctoError::ExploitExecution(format!("invalid abi: {e}")))?;

        for step in &self.steps {
            let key = ctx.env.private_keys.get(step.from).ok_or_else(|| {
                EctoError::ExploitExecution(format!(
                    "step {} signs with account {} outside the funded pool",
                    step.function, step.from
                ))
            })?;
            let tokens = resolve_constructor_params(&step.args, &ctx.env)?;
            let value = match &step.value {
                Some(v) => Some(parse_u256(v)?),
                None => None,
            };
            let gas = self.gas;
            let options = Options::with(|opt| {
                opt.gas = Some(gas.into());
                opt.value = value;
            });

            let receipt = contract
                .signed_call_with_confirmations(&step.function, tokens, options, 1, key)
                .await
                .map_err(|e| EctoError::ExploitExecution(format!("{}: {e}", step.function)))?;

            let landed = receipt.status == Some(1u64.into());
            let step_ok = landed != step.expect_revert;
            debug!(
                exploit = %self.name,
                function = %step.function,
                landed,
                expect_revert = step.expect_revert,
                "exploit step settled"
            );
            if !step_ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
