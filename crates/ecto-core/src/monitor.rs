//! Monitor lifecycle state machine.
//!
//! A monitor pairs one detection model with one deployed contract instance.
//! The monitor task owns its state exclusively; the orchestrator observes an
//! ordered stream of transitions over a channel and issues commands back.
//! Reaching [`MonitorState::Running`] is the sole authorization signal for
//! exploit execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use web3::types::Address;

use crate::config::ModelConfig;
use crate::error::{EctoError, Result};

/// Lifecycle states. Transitions are monotonic and single-direction:
/// `Created → Initialized → Running → (Completed | Failed)`, with `Failed`
/// reachable from any non-terminal state. Each transition fires at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Created,
    Initialized,
    Running,
    Completed,
    Failed,
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitorState::Completed | MonitorState::Failed)
    }

    /// Whether exploit execution is authorized in this state.
    pub fn authorizes_execution(&self) -> bool {
        matches!(self, MonitorState::Running)
    }
}

/// Everything a monitor instance needs at construction: the deployed target
/// and the model configuration bundle.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub contract_address: Address,
    /// Variant-qualified label, e.g. `Vault-2`.
    pub contract_label: String,
    pub contract_name: String,
    pub abi: Value,
    pub model: ModelConfig,
}

/// Seam for the model's internal activity/response computation, which is
/// outside this crate's scope. Called once per monitor; an error becomes the
/// `Failed` terminal transition instead of hanging the lifecycle.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, config: &MonitorConfig) -> Result<()>;
}

/// Default loader: validates the statically supplied model configuration.
pub struct ConfigModelLoader;

#[async_trait]
impl ModelLoader for ConfigModelLoader {
    async fn load(&self, config: &MonitorConfig) -> Result<()> {
        if config.model.id.is_empty() {
            return Err(EctoError::Config("model id is empty".to_string()));
        }
        if config.model.activities.is_empty() {
            return Err(EctoError::Config(format!(
                "model {} declares no activities",
                config.model.id
            )));
        }
        debug!(
            model = %config.model.id,
            activities = config.model.activities.len(),
            response_relation = config.model.has_response_relation,
            "model configuration loaded"
        );
        Ok(())
    }
}

#[derive(Debug)]
enum MonitorCommand {
    Start,
    Close { ok: bool },
}

/// Handle to a spawned monitor instance. Exactly one exists per
/// (contract-variant, model) pair; instances are never reused.
pub struct Monitor {
    contract_address: Address,
    model_id: String,
    commands: mpsc::Sender<MonitorCommand>,
}

impl Monitor {
    /// Spawn the monitor task. Returns the command handle plus the single
    /// transition subscription.
    pub fn spawn(
        config: MonitorConfig,
        loader: Arc<dyn ModelLoader>,
    ) -> (Monitor, mpsc::UnboundedReceiver<MonitorState>) {
        let (transition_tx, transition_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(4);

        let monitor = Monitor {
            contract_address: config.contract_address,
            model_id: config.model.id.clone(),
            commands: command_tx,
        };

        tokio::spawn(run_lifecycle(config, loader, command_rx, transition_tx));

        (monitor, transition_rx)
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Request the `Initialized → Running` transition.
    pub async fn start(&self) -> Result<()> {
        self.commands
            .send(MonitorCommand::Start)
            .await
            .map_err(|_| {
                EctoError::Aggregation("monitor command channel closed before start".to_string())
            })
    }

    /// Close the observation window; the monitor emits its terminal state.
    /// A monitor that already failed ignores this.
    pub async fn close(&self, ok: bool) {
        let _ = self.commands.send(MonitorCommand::Close { ok }).await;
    }
}

async fn run_lifecycle(
    config: MonitorConfig,
    loader: Arc<dyn ModelLoader>,
    mut commands: mpsc::Receiver<MonitorCommand>,
    transitions: mpsc::UnboundedSender<MonitorState>,
) {
    let mut state = MonitorState::Created;

    match loader.load(&config).await {
        Ok(()) => {
            state = MonitorState::Initialized;
            let _ = transitions.send(state);
        }
        Err(e) => {
            warn!(
                model = %config.model.id,
                contract = %config.contract_label,
                "model load failed: {e}"
            );
            let _ = transitions.send(MonitorState::Failed);
            return;
        }
    }

    while let Some(command) = commands.recv().await {
        match (state, command) {
            (MonitorState::Initialized, MonitorCommand::Start) => {
                state = MonitorState::Running;
                info!(
                    model = %config.model.id,
                    contract = %format!("{:#x}", config.contract_address),
                    "monitor running"
                );
                let _ = transitions.send(state);
            }
            (MonitorState::Running, MonitorCommand::Close { ok }) => {
                state = if ok {
                    MonitorState::Completed
                } else {
                    MonitorState::Failed
                };
                let _ = transitions.send(state);
                break;
            }
            (current, command) => {
                debug!(?current, ?command, "ignoring out-of-order monitor command");
            }
        }
    }

    // Command handle dropped with the window still open: the observation
    // can never close normally, so the lifecycle ends failed rather than
    // hanging its subscriber.
    if !state.is_terminal() {
        let _ = transitions.send(MonitorState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingLoader;

    #[async_trait]
    impl ModelLoader for FailingLoader {
        async fn load(&self, _config: &MonitorConfig) -> Result<()> {
            Err(EctoError::Config("activity graph unavailable".to_string()))
        }
    }

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            contract_address: Address::from_low_u64_be(0xec70),
            contract_label: "Vault-1".to_string(),
            contract_name: "Vault".to_string(),
            abi: json!([]),
            model: ModelConfig {
                id: "m-reentrancy".to_string(),
                has_response_relation: true,
                function_params: Default::default(),
                activities: vec!["deposit".to_string(), "withdraw".to_string()],
            },
        }
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorState>) -> Vec<MonitorState> {
        let mut seen = Vec::new();
        while let Some(state) = rx.recv().await {
            let terminal = state.is_terminal();
            seen.push(state);
            if terminal {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_full_lifecycle_ordering() {
        let (monitor, mut rx) = Monitor::spawn(monitor_config(), Arc::new(ConfigModelLoader));

        assert_eq!(rx.recv().await, Some(MonitorState::Initialized));
        monitor.start().await.unwrap();
        assert_eq!(rx.recv().await, Some(MonitorState::Running));
        monitor.close(true).await;
        assert_eq!(rx.recv().await, Some(MonitorState::Completed));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_failed_close_emits_failed() {
        let (monitor, mut rx) = Monitor::spawn(monitor_config(), Arc::new(ConfigModelLoader));

        assert_eq!(rx.recv().await, Some(MonitorState::Initialized));
        monitor.start().await.unwrap();
        assert_eq!(rx.recv().await, Some(MonitorState::Running));
        monitor.close(false).await;
        assert_eq!(rx.recv().await, Some(MonitorState::Failed));
    }

    #[tokio::test]
    async fn test_loader_error_becomes_failed_without_initialized() {
        let (_monitor, mut rx) = Monitor::spawn(monitor_config(), Arc::new(FailingLoader));

        let seen = drain(&mut rx).await;
        assert_eq!(seen, vec![MonitorState::Failed]);
    }

    #[tokio::test]
    async fn test_empty_activity_set_fails_initialization() {
        let mut config = monitor_config();
        config.model.activities.clear();
        let (_monitor, mut rx) = Monitor::spawn(config, Arc::new(ConfigModelLoader));

        let seen = drain(&mut rx).await;
        assert_eq!(seen, vec![MonitorState::Failed]);
    }

    #[tokio::test]
    async fn test_close_before_start_is_ignored() {
        let (monitor, mut rx) = Monitor::spawn(monitor_config(), Arc::new(ConfigModelLoader));

        assert_eq!(rx.recv().await, Some(MonitorState::Initialized));
        monitor.close(true).await;
        drop(monitor);

        // The window never opened, so dropping the handle fails the
        // lifecycle; it must not reach Completed.
        let seen = drain(&mut rx).await;
        assert_eq!(seen, vec![MonitorState::Failed]);
    }

    #[tokio::test]
    async fn test_duplicate_start_fires_running_once() {
        let (monitor, mut rx) = Monitor::spawn(monitor_config(), Arc::new(ConfigModelLoader));

        assert_eq!(rx.recv().await, Some(MonitorState::Initialized));
        monitor.start().await.unwrap();
        monitor.start().await.unwrap();
        monitor.close(true).await;

        let mut seen = vec![];
        while let Some(state) = rx.recv().await {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![MonitorState::Running, MonitorState::Completed]
        );
    }

    #[tokio::test]
    async fn test_dropped_handle_mid_window_fails_lifecycle() {
        let (monitor, mut rx) = Monitor::spawn(monitor_config(), Arc::new(ConfigModelLoader));

        assert_eq!(rx.recv().await, Some(MonitorState::Initialized));
        monitor.start().await.unwrap();
        assert_eq!(rx.recv().await, Some(MonitorState::Running));
        drop(monitor);
        assert_eq!(rx.recv().await, Some(MonitorState::Failed));
    }

    #[test]
    fn test_state_predicates() {
        assert!(MonitorState::Running.authorizes_execution());
        assert!(!MonitorState::Initialized.authorizes_execution());
        assert!(!MonitorState::Created.authorizes_execution());
        assert!(MonitorState::Completed.is_terminal());
        assert!(MonitorState::Failed.is_terminal());
        assert!(!MonitorState::Running.is_terminal());
    }
}
