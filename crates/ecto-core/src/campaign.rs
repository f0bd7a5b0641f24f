//! Campaign orchestration and outcome aggregation.
//!
//! A campaign iterates contracts × variants × models. Per contract it
//! provisions one environment; per triple it runs the compile/deploy
//! pipeline, attaches a monitor, and — once the monitor authorizes — runs
//! the exploit suite concurrently. Local failures are recorded and the
//! campaign continues; it never aborts early.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use web3::transports::Http;
use web3::Web3;

use crate::config::{CampaignConfig, ContractDescriptor, ModelConfig, ProvisionerSettings};
use crate::env::{ActiveMonitors, Environment, EnvironmentHandle, EnvironmentProvisioner, NodeFlavor};
use crate::error::{EctoError, Result};
use crate::exploit::{run_exploits, ExploitContext, ExploitOutcome, ExploitRegistry};
use crate::monitor::{ConfigModelLoader, ModelLoader, Monitor, MonitorConfig, MonitorState};
use crate::pipeline::{self, SolcCompiler};
use crate::ports::{free_ports, pick_port};

/// Aggregate result of one campaign. Mutated only by the orchestrator,
/// finalized at campaign end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignResult {
    pub campaign_id: Uuid,
    pub successes: usize,
    pub failures: usize,
    /// Failed outcomes in the order they were recorded.
    pub failed: Vec<ExploitOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CampaignResult {
    pub fn new() -> Self {
        Self {
            campaign_id: Uuid::new_v4(),
            successes: 0,
            failures: 0,
            failed: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record(&mut self, outcome: ExploitOutcome) {
        if outcome.success {
            self.successes += 1;
        } else {
            self.failures += 1;
            self.failed.push(outcome);
        }
    }

    /// Total scripts accounted for: every attempted script plus every
    /// script skipped by an earlier pipeline failure.
    pub fn attempted(&self) -> usize {
        self.successes + self.failures
    }

    fn finalize(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

impl Default for CampaignResult {
    fn default() -> Self {
        Self::new()
    }
}

/// One failure outcome per exploit of a triple whose pipeline never reached
/// execution; skipped scripts are counted, not silently dropped.
pub(crate) fn failure_outcomes(
    contract_label: &str,
    exploits: &[String],
    reason: &str,
) -> Vec<ExploitOutcome> {
    exploits
        .iter()
        .map(|exploit| ExploitOutcome::failed(contract_label, exploit, Some(reason.to_string())))
        .collect()
}

/// Top-level campaign driver.
pub struct CampaignOrchestrator {
    config: CampaignConfig,
    registry: Arc<ExploitRegistry>,
    loader: Arc<dyn ModelLoader>,
    flavors: HashMap<String, NodeFlavor>,
}

impl CampaignOrchestrator {
    pub fn new(config: CampaignConfig, registry: ExploitRegistry) -> Self {
        let mut flavors = HashMap::new();
        for flavor in [NodeFlavor::anvil(), NodeFlavor::solana_test_validator()] {
            flavors.insert(flavor.name.clone(), flavor);
        }
        Self {
            config,
            registry: Arc::new(registry),
            loader: Arc::new(ConfigModelLoader),
            flavors,
        }
    }

    /// Replace the model loader seam (the default validates static config).
    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Register or override an environment flavor.
    pub fn with_flavor(mut self, flavor: NodeFlavor) -> Self {
        self.flavors.insert(flavor.name.clone(), flavor);
        self
    }

    /// Run the whole campaign. This is the single externally invoked
    /// operation; it resolves once every exploit run and every environment
    /// teardown has settled.
    pub async fn run(self) -> Result<CampaignResult> {
        let mut result = CampaignResult::new();
        info!(
            campaign = %result.campaign_id,
            contracts = self.config.contracts.len(),
            "starting campaign"
        );

        let compiler = Arc::new(SolcCompiler::new(self.config.toolchain_dir.clone()));
        let settings = self.config.provisioner.clone();
        let mut runs: Vec<JoinHandle<Vec<ExploitOutcome>>> = Vec::new();
        let mut teardowns: Vec<JoinHandle<()>> = Vec::new();

        for contract in &self.config.contracts {
            debug!(contract = %contract.name, variants = contract.variants, "working on contract");

            let (flavor, exploit_names) = match self.resolve_suite(contract) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(contract = %contract.name, "cannot resolve test suite: {e}");
                    self.record_contract_failure(&mut result, contract, None, &e.to_string());
                    continue;
                }
            };

            let provisioner = EnvironmentProvisioner::new(flavor, settings.clone());
            let env = match self.provision_environment(&provisioner, &settings).await {
                Ok(env) => env,
                Err(e) => {
                    warn!(contract = %contract.name, "environment provisioning failed: {e}");
                    self.record_contract_failure(
                        &mut result,
                        contract,
                        Some(&exploit_names),
                        &format!("environment provisioning failed: {e}"),
                    );
                    continue;
                }
            };

            let monitors = env.monitors();
            let client = Arc::clone(&env.client);
            let handle = env.handle.clone();

            for variant in 1..=contract.variants {
                let label = format!("{}-{}", contract.name, variant);
                for model_id in &contract.models {
                    let Some(model) = self.config.model(model_id) else {
                        warn!(contract = %label, model = %model_id, "model not found in configuration");
                        for outcome in failure_outcomes(
                            &label,
                            &exploit_names,
                            &format!("model {model_id} not found in configuration"),
                        ) {
                            result.record(outcome);
                        }
                        continue;
                    };

                    match self
                        .prepare_triple(contract, variant, &label, model, &handle, &client, &compiler, &settings)
                        .await
                    {
                        Ok((monitor, transitions, ctx)) => {
                            monitors.register().await;
                            let names = exploit_names.clone();
                            let registry = Arc::clone(&self.registry);
                            let monitors = Arc::clone(&monitors);
                            let label = label.clone();
                            runs.push(tokio::spawn(async move {
                                run_triple(monitor, transitions, ctx, names, registry, monitors, label)
                                    .await
                            }));
                        }
                        Err(e) => {
                            warn!(contract = %label, model = %model_id, "pipeline failed: {e}");
                            for outcome in failure_outcomes(&label, &exploit_names, &e.to_string())
                            {
                                result.record(outcome);
                            }
                        }
                    }
                }
            }

            // Completion-triggered teardown: the environment dies when its
            // last monitor releases, with the safety timeout as last resort.
            let safety = settings.safety_timeout();
            let teardown_monitors = env.monitors();
            let contract_name = contract.name.clone();
            teardowns.push(tokio::spawn(async move {
                tokio::select! {
                    _ = teardown_monitors.wait_idle() => {
                        debug!(contract = %contract_name, "all monitors released, tearing down environment");
                    }
                    _ = tokio::time::sleep(safety) => {
                        warn!(contract = %contract_name, "safety timeout reached, force-killing environment");
                    }
                }
                env.terminate().await;
            }));
        }

        // The only cross-environment synchronization point: settle every
        // exploit run, then every teardown.
        for run in futures::future::join_all(runs).await {
            match run {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        result.record(outcome);
                    }
                }
                Err(e) => {
                    let reason = EctoError::Aggregation(format!("exploit run task died: {e}"));
                    error!("{reason}");
                    result.record(ExploitOutcome::failed(
                        "unknown",
                        "unknown",
                        Some(reason.to_string()),
                    ));
                }
            }
        }
        let _ = futures::future::join_all(teardowns).await;

        result.finalize();
        report(&result);
        Ok(result)
    }

    fn resolve_suite(&self, contract: &ContractDescriptor) -> Result<(NodeFlavor, Vec<String>)> {
        let suite_name = contract.tests.first().ok_or_else(|| {
            EctoError::Config(format!("contract {} references no test suite", contract.name))
        })?;
        let suite = self.config.test(suite_name).ok_or_else(|| {
            EctoError::Config(format!("test suite {suite_name} not found in configuration"))
        })?;
        let flavor = self.flavors.get(&suite.environment).cloned().ok_or_else(|| {
            EctoError::Config(format!(
                "unknown environment flavor {} in suite {suite_name}",
                suite.environment
            ))
        })?;
        Ok((flavor, suite.files.clone()))
    }

    async fn provision_environment(
        &self,
        provisioner: &EnvironmentProvisioner,
        settings: &ProvisionerSettings,
    ) -> Result<Environment> {
        let free = free_ports(settings.base_port, settings.scan_width).await?;
        let port = pick_port(&free).ok_or(EctoError::NoFreePort {
            base: settings.base_port,
            width: settings.scan_width,
        })?;
        provisioner.provision(port).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_triple(
        &self,
        contract: &ContractDescriptor,
        variant: u32,
        label: &str,
        model: &ModelConfig,
        env: &EnvironmentHandle,
        client: &Arc<Web3<Http>>,
        compiler: &SolcCompiler,
        settings: &ProvisionerSettings,
    ) -> Result<(Monitor, mpsc::UnboundedReceiver<MonitorState>, ExploitContext)> {
        let args = pipeline::resolve_constructor_params(&contract.constructor_params, env)?;
        debug!(contract = %label, args = args.len(), "constructor parameters resolved");

        let source_path = self.config.contracts_dir.join(format!("{label}.sol"));
        let source = tokio::fs::read_to_string(&source_path)
            .await
            .map_err(|e| EctoError::Compile {
                unit: label.to_string(),
                diagnostics: format!("cannot read {}: {e}", source_path.display()),
            })?;

        let version = pipeline::extract_compiler_version(&source)?;
        let compiled = compiler.compile(&source, label, &contract.name, &version).await?;
        let deployed = pipeline::deploy(client, &compiled, env, args, variant, settings).await?;

        let monitor_config = MonitorConfig {
            contract_address: deployed.address,
            contract_label: label.to_string(),
            contract_name: contract.name.clone(),
            abi: deployed.abi.clone(),
            model: model.clone(),
        };
        let (monitor, transitions) = Monitor::spawn(monitor_config, Arc::clone(&self.loader));

        let ctx = ExploitContext {
            client: Arc::clone(client),
            env: env.clone(),
            contract: deployed,
        };
        Ok((monitor, transitions, ctx))
    }

    fn record_contract_failure(
        &self,
        result: &mut CampaignResult,
        contract: &ContractDescriptor,
        exploit_names: Option<&[String]>,
        reason: &str,
    ) {
        // When the suite itself could not be resolved there are no script
        // names yet; the suite reference stands in so the skip is counted.
        let fallback = vec![contract
            .tests
            .first()
            .cloned()
            .unwrap_or_else(|| "unresolved-suite".to_string())];
        let names = exploit_names.unwrap_or(&fallback);
        for variant in 1..=contract.variants {
            let label = format!("{}-{}", contract.name, variant);
            for _model in &contract.models {
                for outcome in failure_outcomes(&label, names, reason) {
                    result.record(outcome);
                }
            }
        }
    }
}

/// Drive one monitor to authorization, execute the suite, close the
/// observation window, and release the environment slot.
async fn run_triple(
    monitor: Monitor,
    mut transitions: mpsc::UnboundedReceiver<MonitorState>,
    ctx: ExploitContext,
    exploit_names: Vec<String>,
    registry: Arc<ExploitRegistry>,
    monitors: Arc<ActiveMonitors>,
    label: String,
) -> Vec<ExploitOutcome> {
    let outcomes = drive_and_execute(
        &monitor,
        &mut transitions,
        ctx,
        &exploit_names,
        &registry,
        &label,
    )
    .await;
    monitors.release().await;
    outcomes
}

async fn drive_and_execute(
    monitor: &Monitor,
    transitions: &mut mpsc::UnboundedReceiver<MonitorState>,
    ctx: ExploitContext,
    exploit_names: &[String],
    registry: &ExploitRegistry,
    label: &str,
) -> Vec<ExploitOutcome> {
    loop {
        match transitions.recv().await {
            Some(MonitorState::Initialized) => {
                debug!(contract = %label, model = %monitor.model_id(), "monitor initialized");
                if let Err(e) = monitor.start().await {
                    return failure_outcomes(label, exploit_names, &format!("monitor start failed: {e}"));
                }
            }
            Some(MonitorState::Running) => break,
            Some(MonitorState::Failed) => {
                return failure_outcomes(
                    label,
                    exploit_names,
                    "monitor failed before authorizing execution",
                );
            }
            Some(other) => debug!(contract = %label, ?other, "monitor transition"),
            None => {
                return failure_outcomes(
                    label,
                    exploit_names,
                    "monitor transition stream ended before authorizing execution",
                );
            }
        }
    }

    info!(contract = %label, model = %monitor.model_id(), "monitor running, executing exploits");
    let outcomes = run_exploits(registry, exploit_names, Arc::new(ctx), label).await;

    let all_ok = outcomes.iter().all(|o| o.success);
    monitor.close(all_ok).await;
    // Drain to the terminal transition so the lifecycle closes before the
    // environment slot is released.
    while let Some(state) = transitions.recv().await {
        if state.is_terminal() {
            debug!(contract = %label, ?state, "monitor lifecycle closed");
            break;
        }
    }
    outcomes
}

fn report(result: &CampaignResult) {
    let rule = "= ".repeat(40);
    info!("{rule}");
    info!("Finished executing all exploits.");
    info!(
        successes = result.successes,
        failures = result.failures,
        "campaign complete"
    );
    for outcome in &result.failed {
        info!(
            contract = %outcome.contract,
            exploit = %outcome.exploit,
            reason = ?outcome.reason,
            "failed exploit"
        );
    }
    info!("{rule}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::generate_account_pool;
    use crate::monitor::ConfigModelLoader;
    use crate::pipeline::DeployedContract;
    use serde_json::json;
    use web3::types::Address;

    fn test_ctx() -> ExploitContext {
        let (accounts, private_keys) = generate_account_pool(2);
        ExploitContext {
            client: Arc::new(Web3::new(Http::new("http://127.0.0.1:1").unwrap())),
            env: EnvironmentHandle {
                rpc_url: "http://127.0.0.1:1".to_string(),
                accounts,
                private_keys,
                pid: 1,
            },
            contract: DeployedContract {
                address: Address::from_low_u64_be(0xec70),
                abi: json!([]),
                bytecode: "6080".to_string(),
                variant: 1,
            },
        }
    }

    fn test_monitor_config() -> MonitorConfig {
        MonitorConfig {
            contract_address: Address::from_low_u64_be(0xec70),
            contract_label: "Vault-1".to_string(),
            contract_name: "Vault".to_string(),
            abi: json!([]),
            model: ModelConfig {
                id: "m1".to_string(),
                has_response_relation: false,
                function_params: Default::default(),
                activities: vec!["withdraw".to_string()],
            },
        }
    }

    #[test]
    fn test_result_recording() {
        let mut result = CampaignResult::new();
        result.record(ExploitOutcome::succeeded("Vault-1", "drain"));
        result.record(ExploitOutcome::failed("Vault-1", "overflow", None));
        result.record(ExploitOutcome::failed(
            "Vault-2",
            "drain",
            Some("compile failed".to_string()),
        ));

        assert_eq!(result.successes, 1);
        assert_eq!(result.failures, 2);
        assert_eq!(result.attempted(), 3);
        assert_eq!(result.failed.len(), 2);
        // Failure list preserves recording order.
        assert_eq!(result.failed[0].exploit, "overflow");
        assert_eq!(result.failed[1].contract, "Vault-2");
    }

    #[test]
    fn test_result_finalize_stamps_end() {
        let mut result = CampaignResult::new();
        assert!(result.finished_at.is_none());
        result.finalize();
        assert!(result.finished_at.is_some());
    }

    #[test]
    fn test_failure_outcomes_cover_every_script() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let outcomes = failure_outcomes("Vault-2", &names, "bad pragma");
        assert_eq!(outcomes.len(), 3);
        for (outcome, name) in outcomes.iter().zip(&names) {
            assert_eq!(&outcome.exploit, name);
            assert!(!outcome.success);
            assert_eq!(outcome.reason.as_deref(), Some("bad pragma"));
        }
    }

    #[tokio::test]
    async fn test_run_triple_drives_lifecycle_and_releases_slot() {
        let (monitor, transitions) =
            Monitor::spawn(test_monitor_config(), Arc::new(ConfigModelLoader));
        let monitors = Arc::new(ActiveMonitors::default());
        monitors.register().await;

        // Empty registry: the single configured exploit settles as a
        // recorded failure, which still closes the lifecycle.
        let outcomes = run_triple(
            monitor,
            transitions,
            test_ctx(),
            vec!["ghost".to_string()],
            Arc::new(ExploitRegistry::new()),
            Arc::clone(&monitors),
            "Vault-1".to_string(),
        )
        .await;

        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].reason.as_ref().unwrap().contains("registered"));
        assert_eq!(monitors.active().await, 0);
    }

    #[tokio::test]
    async fn test_run_triple_records_monitor_failure() {
        struct FailingLoader;

        #[async_trait::async_trait]
        impl ModelLoader for FailingLoader {
            async fn load(&self, _config: &MonitorConfig) -> Result<()> {
                Err(EctoError::Config("no activity graph".to_string()))
            }
        }

        let (monitor, transitions) = Monitor::spawn(test_monitor_config(), Arc::new(FailingLoader));
        let monitors = Arc::new(ActiveMonitors::default());
        monitors.register().await;

        let outcomes = run_triple(
            monitor,
            transitions,
            test_ctx(),
            vec!["drain".to_string(), "probe".to_string()],
            Arc::new(ExploitRegistry::new()),
            Arc::clone(&monitors),
            "Vault-1".to_string(),
        )
        .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.reason.as_ref().unwrap().contains("monitor failed")));
        assert_eq!(monitors.active().await, 0);
    }
}
